//! Fly.io machine definition for the frps tunnel server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

use crate::annotations::{self, MachineOverrides};
use crate::frp;
use crate::naming::{self, NameKind};
use crate::provider::{GuestConfig, InitConfig, MachineConfig, MachineInput, MachinePort, MachineService};

use super::TunnelConfig;

/// Environment variable the init command reads the frps config from.
pub const SERVER_CONFIG_ENV: &str = "FRP_SERVER_CONFIG";

pub const DEFAULT_MACHINE_SIZE: &str = "shared-cpu-1x";

const INIT_SCRIPT: &str = "mkdir -p /etc/frp && echo \"$FRP_SERVER_CONFIG\" > /etc/frp/frps.toml && exec frps -c /etc/frp/frps.toml";

/// Guest allocation for a machine size preset. Unknown presets get the
/// smallest shared machine.
pub fn guest_for_size(size: &str) -> GuestConfig {
    let (cpu_kind, cpus, memory_mb) = match size {
        "shared-cpu-2x" => ("shared", 2, 512),
        "shared-cpu-4x" => ("shared", 4, 1024),
        "performance-1x" => ("performance", 1, 2048),
        "performance-2x" => ("performance", 2, 4096),
        _ => ("shared", 1, 256),
    };
    GuestConfig {
        cpu_kind: cpu_kind.to_string(),
        cpus,
        memory_mb,
    }
}

/// Build the create/update body for the machine serving `service`.
pub fn build_machine_input(service: &Service, config: &TunnelConfig) -> MachineInput {
    let overrides = MachineOverrides::from_annotations(&annotations::of(service));
    let region = overrides
        .region
        .unwrap_or_else(|| config.fly_region.clone());
    let size = overrides
        .size
        .unwrap_or_else(|| config.fly_machine_size.clone());

    let mut services = vec![MachineService {
        protocol: "tcp".to_string(),
        internal_port: frp::DEFAULT_SERVER_PORT,
        ports: vec![MachinePort {
            port: frp::DEFAULT_SERVER_PORT,
            handlers: Vec::new(),
        }],
    }];
    services.extend(frp::service_ports(service).iter().map(|p| MachineService {
        protocol: frp::port_protocol(p).to_string(),
        internal_port: p.port,
        ports: vec![MachinePort {
            port: p.port,
            handlers: Vec::new(),
        }],
    }));

    MachineInput {
        name: naming::for_service(NameKind::Tunnel, service),
        region,
        config: MachineConfig {
            image: config.frps_image.clone(),
            env: BTreeMap::from([(
                SERVER_CONFIG_ENV.to_string(),
                frp::server_config(frp::DEFAULT_SERVER_PORT),
            )]),
            services,
            guest: Some(guest_for_size(&size)),
            init: Some(InitConfig {
                entrypoint: vec!["sh".to_string()],
                cmd: vec!["-c".to_string(), INIT_SCRIPT.to_string()],
            }),
        },
    }
}
