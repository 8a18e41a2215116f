//! Resource requirements for the frpc container.
//!
//! Defaults can be overridden per Service through annotations. Every override
//! is validated as a Kubernetes quantity before anything is applied.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::annotations::{
    FRPC_CPU_LIMIT, FRPC_CPU_REQUEST, FRPC_MEMORY_LIMIT, FRPC_MEMORY_REQUEST,
};
use crate::error::{OperatorError, Result};

const DEFAULT_CPU_REQUEST: &str = "10m";
const DEFAULT_MEMORY_REQUEST: &str = "32Mi";
const DEFAULT_MEMORY_LIMIT: &str = "128Mi";

#[derive(Debug, Clone, Copy)]
enum Target {
    Requests,
    Limits,
}

/// Annotation key, resource name, and which list it lands in.
const OVERRIDES: [(&str, &str, Target); 4] = [
    (FRPC_CPU_REQUEST, "cpu", Target::Requests),
    (FRPC_CPU_LIMIT, "cpu", Target::Limits),
    (FRPC_MEMORY_REQUEST, "memory", Target::Requests),
    (FRPC_MEMORY_LIMIT, "memory", Target::Limits),
];

/// Default frpc requirements: small CPU and memory requests, a moderate
/// memory limit and no CPU limit.
pub fn default_requirements() -> ResourceRequirements {
    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(DEFAULT_CPU_REQUEST.to_string())),
        ("memory".to_string(), Quantity(DEFAULT_MEMORY_REQUEST.to_string())),
    ]);
    let limits = BTreeMap::from([(
        "memory".to_string(),
        Quantity(DEFAULT_MEMORY_LIMIT.to_string()),
    )]);

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

/// Merge the override annotations over the defaults.
///
/// Fails on the first annotation that is not a valid quantity; nothing is
/// partially applied in that case.
pub fn resolve(annotations: &BTreeMap<String, String>) -> Result<ResourceRequirements> {
    let defaults = default_requirements();
    let mut requests = defaults.requests.unwrap_or_default();
    let mut limits = defaults.limits.unwrap_or_default();

    for (key, resource, target) in OVERRIDES {
        let raw = match annotations.get(key) {
            Some(v) if !v.is_empty() => v,
            _ => continue,
        };
        let quantity = parse_quantity(raw).map_err(|reason| {
            OperatorError::Validation(format!(
                "parsing annotation {}={:?}: {}",
                key, raw, reason
            ))
        })?;
        let list = match target {
            Target::Requests => &mut requests,
            Target::Limits => &mut limits,
        };
        list.insert(resource.to_string(), quantity);
    }

    Ok(ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    })
}

/// Validate `raw` against the Kubernetes quantity grammar:
/// `<sign><digits>[.<digits>]<suffix>` where the suffix is a binary SI
/// (`Ki`..`Ei`), decimal SI (`n`, `u`, `m`, `k`, `M`..`E`) or a decimal
/// exponent (`e3`, `E-2`).
pub fn parse_quantity(raw: &str) -> std::result::Result<Quantity, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("quantity is empty".to_string());
    }

    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);

    let number_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_end);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    if fraction.is_some_and(|f| f.contains('.')) {
        return Err("more than one decimal point".to_string());
    }
    let digits = whole.len() + fraction.map_or(0, str::len);
    if digits == 0 {
        return Err("quantity has no digits".to_string());
    }

    if !is_valid_suffix(suffix) {
        return Err(format!("unknown suffix {:?}", suffix));
    }

    Ok(Quantity(s.to_string()))
}

fn is_valid_suffix(suffix: &str) -> bool {
    const SUFFIXES: [&str; 16] = [
        "", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "M", "G", "T", "P", "E",
    ];
    if SUFFIXES.contains(&suffix) {
        return true;
    }

    let exponent = match suffix.strip_prefix(['e', 'E']) {
        Some(e) => e,
        None => return false,
    };
    let exponent = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
    !exponent.is_empty() && exponent.chars().all(|c| c.is_ascii_digit())
}
