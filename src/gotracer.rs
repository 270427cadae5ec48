//! Bundle definition for the Go-runtime tracer.
//!
//! Go binaries are instrumented purely from user space: entry probes on the
//! runtime and on the HTTP/gRPC/SQL entry points, with function returns
//! covered by entry-emulated return probes (Go's growable stacks rule out
//! kernel uretprobes). The compiled artifacts are opaque inputs; this module
//! only declares what attaches where and which constants get patched in.

use std::sync::Arc;

use bpf_common::bundle::{BundleArtifacts, ConstantSpec, ProgramBundle};
use bpf_common::offsets::Offsets;
use bpf_common::pump::EventDecoder;

/// Struct-field offsets the offset provider must supply for every traced
/// binary. Loading fails when one of these is missing.
pub const REQUIRED_FIELDS: &[&str] = &[
    // Go net/http
    "url_ptr_pos",
    "path_ptr_pos",
    "method_ptr_pos",
    "status_code_ptr_pos",
    "content_length_ptr_pos",
    "req_header_ptr_pos",
    "io_writer_buf_ptr_pos",
    "io_writer_n_pos",
    "tcp_addr_port_ptr_pos",
    "tcp_addr_ip_ptr_pos",
    "pc_conn_pos",
    "pc_tls_pos",
    "c_rwc_pos",
    "c_tls_pos",
    "net_conn_pos",
    "conn_fd_pos",
    "fd_laddr_pos",
    "fd_raddr_pos",
];

/// Offsets which depend on optional libraries (http2, gRPC). Binaries not
/// linking them get the all-ones sentinel instead.
pub const OPTIONAL_FIELDS: &[&str] = &[
    "cc_next_stream_id_pos",
    "framer_w_pos",
    "cc_tconn_pos",
    "sc_conn_pos",
    // Go gRPC
    "grpc_stream_st_ptr_pos",
    "grpc_stream_method_ptr_pos",
    "grpc_status_s_pos",
    "grpc_status_code_ptr_pos",
    "grpc_st_conn_pos",
    "grpc_stream_ctx_ptr_pos",
    "grpc_t_conn_pos",
    "grpc_t_scheme_pos",
    "value_context_val_ptr_pos",
    "http2_client_next_id_pos",
    "grpc_transport_buf_writer_buf_pos",
    "grpc_transport_buf_writer_offset_pos",
];

/// Build the Go tracer bundle. `wakeup_data_bytes` tells the kernel side how
/// much ring-buffer data may accumulate before waking the reader.
pub fn bundle(
    artifacts: BundleArtifacts,
    offsets: Arc<Offsets>,
    decoder: Arc<dyn EventDecoder>,
    wakeup_data_bytes: u64,
) -> ProgramBundle {
    ProgramBundle::new("go", artifacts, offsets, decoder)
        .with_context_propagation()
        .constants(ConstantSpec {
            required: REQUIRED_FIELDS,
            optional: OPTIONAL_FIELDS,
            fixed: vec![("wakeup_data_bytes", wakeup_data_bytes)],
        })
        // Go runtime: goroutine lifecycle.
        .goprobe(
            "runtime.newproc1",
            Some("uprobe_proc_newproc1"),
            Some("uprobe_proc_newproc1_ret"),
        )
        .goprobe("runtime.goexit1", Some("uprobe_proc_goexit1"), None)
        // Go net/http server.
        .goprobe(
            "net/http.serverHandler.ServeHTTP",
            Some("uprobe_serve_http"),
            Some("uprobe_serve_http_ret"),
        )
        .goprobe(
            "net/http.(*conn).readRequest",
            Some("uprobe_read_request_start"),
            Some("uprobe_read_request_ret"),
        )
        .goprobe(
            "net/http.(*response).WriteHeader",
            Some("uprobe_http2_response_writer_state_write_header"),
            None,
        )
        // HTTP client; covers Client.Do and direct RoundTripper use.
        .goprobe(
            "net/http.(*Transport).roundTrip",
            Some("uprobe_round_trip"),
            Some("uprobe_round_trip_ret"),
        )
        // http2 client, post-0.22 and earlier external versions plus the
        // copy vendored into the standard library. The return program is
        // shared with http 1.x.
        .goprobe(
            "golang.org/x/net/http2.(*ClientConn).roundTrip",
            Some("uprobe_http2_round_trip"),
            Some("uprobe_round_trip_ret"),
        )
        .goprobe(
            "golang.org/x/net/http2.(*ClientConn).RoundTrip",
            Some("uprobe_http2_round_trip"),
            Some("uprobe_round_trip_ret"),
        )
        .goprobe(
            "net/http.(*http2ClientConn).RoundTrip",
            Some("uprobe_http2_round_trip"),
            Some("uprobe_round_trip_ret"),
        )
        // http2 server: response codes and connection tracking, external and
        // vendored spellings.
        .goprobe(
            "golang.org/x/net/http2.(*responseWriterState).writeHeader",
            Some("uprobe_http2_response_writer_state_write_header"),
            None,
        )
        .goprobe(
            "net/http.(*http2responseWriterState).writeHeader",
            Some("uprobe_http2_response_writer_state_write_header"),
            None,
        )
        .goprobe(
            "golang.org/x/net/http2.(*serverConn).runHandler",
            Some("uprobe_http2_server_conn_run_handler"),
            None,
        )
        .goprobe(
            "net/http.(*http2serverConn).runHandler",
            Some("uprobe_http2_server_conn_run_handler"),
            None,
        )
        // TCP connection tracking for black-box context propagation.
        .goprobe(
            "net/http.(*conn).serve",
            Some("uprobe_conn_serve"),
            Some("uprobe_conn_serve_ret"),
        )
        .goprobe("net.(*netFD).Read", Some("uprobe_net_fd_read"), None)
        .goprobe(
            "net/http.(*persistConn).roundTrip",
            Some("uprobe_persist_conn_round_trip"),
            None,
        )
        // database/sql.
        .goprobe(
            "database/sql.(*DB).queryDC",
            Some("uprobe_query_dc"),
            Some("uprobe_query_ret"),
        )
        .goprobe(
            "database/sql.(*DB).execDC",
            Some("uprobe_exec_dc"),
            Some("uprobe_query_ret"),
        )
        // gRPC server.
        .goprobe(
            "google.golang.org/grpc.(*Server).handleStream",
            Some("uprobe_server_handle_stream"),
            Some("uprobe_server_handle_stream_ret"),
        )
        .goprobe(
            "google.golang.org/grpc/internal/transport.(*http2Server).WriteStatus",
            Some("uprobe_transport_write_status"),
            None,
        )
        .goprobe(
            "google.golang.org/grpc/internal/transport.(*http2Server).operateHeaders",
            Some("uprobe_http2_server_operate_headers"),
            None,
        )
        .goprobe(
            "google.golang.org/grpc/internal/transport.(*serverHandlerTransport).HandleStreams",
            Some("uprobe_server_handler_transport_handle_streams"),
            None,
        )
        // gRPC client.
        .goprobe(
            "google.golang.org/grpc.(*ClientConn).Invoke",
            Some("uprobe_client_conn_invoke"),
            Some("uprobe_client_conn_invoke_ret"),
        )
        .goprobe(
            "google.golang.org/grpc.(*ClientConn).NewStream",
            Some("uprobe_client_conn_new_stream"),
            Some("uprobe_server_handle_stream_ret"),
        )
        .goprobe(
            "google.golang.org/grpc.(*ClientConn).Close",
            Some("uprobe_client_conn_close"),
            None,
        )
        .goprobe(
            "google.golang.org/grpc.(*clientStream).RecvMsg",
            None,
            Some("uprobe_client_stream_recv_msg_ret"),
        )
        .goprobe(
            "google.golang.org/grpc.(*clientStream).CloseSend",
            None,
            Some("uprobe_client_conn_invoke_ret"),
        )
        .goprobe(
            "google.golang.org/grpc/internal/transport.(*http2Client).NewStream",
            Some("uprobe_transport_http2_client_new_stream"),
            None,
        )
        // Context propagation writes trace headers into user memory, so
        // these only attach while the kernel allows that.
        .context_propagation_goprobe(
            "net/http.Header.writeSubset",
            Some("uprobe_write_subset"),
            None,
        )
        .context_propagation_goprobe(
            "golang.org/x/net/http2.(*Framer).WriteHeaders",
            Some("uprobe_http2_framer_write_headers"),
            Some("uprobe_http2_framer_write_headers_ret"),
        )
        .context_propagation_goprobe(
            "net/http.(*http2Framer).WriteHeaders",
            Some("uprobe_http2_framer_write_headers"),
            Some("uprobe_http2_framer_write_headers_ret"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf_common::bundle::MISSING_OFFSET;
    use bpf_common::pump::{DecodeError, Decoded};

    struct NullDecoder;

    impl EventDecoder for NullDecoder {
        fn decode(&self, _record: &[u8]) -> Result<Decoded, DecodeError> {
            Err(DecodeError::Malformed("unused"))
        }
    }

    fn offsets_with_required() -> Offsets {
        let mut offsets = Offsets::default();
        for (i, name) in REQUIRED_FIELDS.iter().enumerate() {
            offsets.fields.insert(name.to_string(), 16 + i as u64);
        }
        offsets
    }

    fn go_bundle(offsets: Offsets) -> ProgramBundle {
        bundle(
            BundleArtifacts::single(&[]),
            Arc::new(offsets),
            Arc::new(NullDecoder),
            640,
        )
    }

    #[test]
    fn absent_optional_offsets_become_the_sentinel() {
        let b = go_bundle(offsets_with_required());
        let constants = b.constant_spec().resolve(b.offsets()).unwrap();

        let lookup = |name: &str| {
            constants
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert_eq!(lookup("url_ptr_pos"), 16);
        assert_eq!(lookup("cc_next_stream_id_pos"), MISSING_OFFSET);
        assert_eq!(lookup("wakeup_data_bytes"), 640);
        assert_eq!(
            constants.len(),
            REQUIRED_FIELDS.len() + OPTIONAL_FIELDS.len() + 1
        );
    }

    #[test]
    fn missing_required_offset_fails_resolution() {
        let mut offsets = offsets_with_required();
        offsets.fields.remove("conn_fd_pos");
        let b = go_bundle(offsets);
        assert!(b.constant_spec().resolve(b.offsets()).is_err());
    }

    #[test]
    fn context_propagation_probes_are_marked() {
        let b = go_bundle(offsets_with_required());
        let table = b.probe_table();

        let cp: Vec<_> = table
            .goprobes
            .iter()
            .filter(|p| p.context_propagation)
            .map(|p| p.symbol)
            .collect();
        assert_eq!(
            cp,
            [
                "net/http.Header.writeSubset",
                "golang.org/x/net/http2.(*Framer).WriteHeaders",
                "net/http.(*http2Framer).WriteHeaders",
            ]
        );
        // Without the capability the rest of the table survives untouched.
        let reduced = table.active(false);
        assert_eq!(reduced.goprobes.len(), table.goprobes.len() - 3);
    }

    #[test]
    fn return_covering_probes_declare_end_programs() {
        let b = go_bundle(offsets_with_required());
        let serve = b
            .probe_table()
            .goprobes
            .iter()
            .find(|p| p.symbol == "net/http.serverHandler.ServeHTTP")
            .unwrap();
        assert_eq!(serve.start_program, Some("uprobe_serve_http"));
        assert_eq!(serve.end_program, Some("uprobe_serve_http_ret"));

        // Some registrations only observe returns.
        let recv = b
            .probe_table()
            .goprobes
            .iter()
            .find(|p| p.symbol == "google.golang.org/grpc.(*clientStream).RecvMsg")
            .unwrap();
        assert!(recv.start_program.is_none());
        assert_eq!(recv.end_program, Some("uprobe_client_stream_recv_msg_ret"));
    }
}
