//! frp configuration rendering.
//!
//! The server (frps) runs on the Fly.io machine and only needs its control
//! port. The client (frpc) runs in the cluster with one proxy per Service
//! port, forwarding the same port number on the server to the Service.

use std::fmt::Write;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;

/// frps control port, reserved on every tunnel machine.
pub const DEFAULT_SERVER_PORT: i32 = 7000;

/// Render the frps configuration.
pub fn server_config(control_port: i32) -> String {
    format!("bindPort = {}\n", control_port)
}

/// Transport of a Service port as frp and Fly.io name it.
pub fn port_protocol(port: &ServicePort) -> &'static str {
    match port.protocol.as_deref() {
        Some("UDP") => "udp",
        _ => "tcp",
    }
}

/// Render the frpc configuration for `service`, connecting to the frps at
/// `server_addr:control_port`.
pub fn client_config(service: &Service, server_addr: &str, control_port: i32) -> String {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    let local_ip = format!("{}.{}.svc.cluster.local", name, namespace);

    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(out, "serverAddr = \"{}\"", server_addr);
    let _ = writeln!(out, "serverPort = {}", control_port);

    for port in service_ports(service) {
        let protocol = port_protocol(port);
        let suffix = match port.name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("{}-{}", protocol, port.port),
        };
        let _ = write!(
            out,
            "\n[[proxies]]\nname = \"{}-{}-{}\"\ntype = \"{}\"\nlocalIP = \"{}\"\nlocalPort = {}\nremotePort = {}\n",
            namespace, name, suffix, protocol, local_ip, port.port, port.port
        );
    }
    out
}

/// Declared ports of a Service, in order.
pub fn service_ports(service: &Service) -> &[ServicePort] {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default()
}
