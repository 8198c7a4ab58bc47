//! Input validation shared by CRD specs and API handlers
//!
//! Kubernetes object names, namespaces and hosts follow RFC 1123; IP access
//! control entries accept a bare address or a CIDR block, as NGINX does.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::Error;

/// Maximum length of a DNS-1123 subdomain (object names)
pub const MAX_SUBDOMAIN_LEN: usize = 253;

/// Maximum length of a DNS-1123 label (namespaces, label segments)
pub const MAX_LABEL_LEN: usize = 63;

/// Parse an access control source: an IPv4/IPv6 address or a CIDR block
pub fn parse_ip_source(value: &str) -> Result<IpNetwork, Error> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("IP source must not be empty"));
    }
    let invalid = || Error::validation(format!("'{value}' is not an IP address or CIDR"));

    // ipnetwork zero-fills short dotted forms like "10.1"; NGINX does not
    let address = trimmed.split('/').next().unwrap_or_default();
    address.parse::<IpAddr>().map_err(|_| invalid())?;
    trimmed.parse::<IpNetwork>().map_err(|_| invalid())
}

/// Validate and normalize a list of access control sources.
///
/// Entries are trimmed and duplicates dropped, keeping first-seen order.
/// `field` is used as the path prefix in error messages (e.g. `AllowIP`).
pub fn normalize_ip_sources(
    resource: &str,
    field: &str,
    values: &[String],
) -> Result<Vec<String>, Error> {
    if values.is_empty() {
        return Err(Error::validation_for_field(
            resource,
            field,
            "at least one IP address or CIDR is required",
        ));
    }

    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        parse_ip_source(value).map_err(|e| e.at(resource, format!("{field}[{i}]")))?;
        let value = value.trim().to_string();
        if seen.insert(value.clone()) {
            normalized.push(value);
        }
    }
    Ok(normalized)
}

/// Parse an Endpoints address; CIDR blocks are not allowed here
pub fn parse_endpoint_ip(value: &str) -> Result<IpAddr, Error> {
    value
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| Error::validation(format!("'{value}' is not an IP address")))
}

/// Validate an object name as an RFC 1123 DNS subdomain
pub fn validate_resource_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::validation("name must not be empty"));
    }
    if name.len() > MAX_SUBDOMAIN_LEN {
        return Err(Error::validation_for(
            name,
            format!("name must be at most {MAX_SUBDOMAIN_LEN} characters"),
        ));
    }
    for segment in name.split('.') {
        check_label(name, segment)?;
    }
    Ok(())
}

/// Validate a namespace as an RFC 1123 DNS label
pub fn validate_namespace(namespace: &str) -> Result<(), Error> {
    if namespace.is_empty() {
        return Err(Error::validation("namespace must not be empty"));
    }
    if namespace.len() > MAX_LABEL_LEN {
        return Err(Error::validation_for(
            namespace,
            format!("namespace must be at most {MAX_LABEL_LEN} characters"),
        ));
    }
    check_label(namespace, namespace)
}

/// Validate a virtual server host; a single leading `*.` wildcard is allowed
pub fn validate_host(host: &str) -> Result<(), Error> {
    let bare = host.strip_prefix("*.").unwrap_or(host);
    if bare.is_empty() {
        return Err(Error::validation("host must not be empty"));
    }
    if bare.parse::<IpAddr>().is_ok() {
        return Err(Error::validation_for(host, "host must be a DNS name, not an IP"));
    }
    validate_resource_name(bare).map_err(|e| Error::validation_for(host, reason(&e)))
}

/// Validate a TCP port number
pub fn validate_port(port: i32) -> Result<(), Error> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "port {port} is out of range (1-65535)"
        )))
    }
}

/// Check that a value looks like a PEM document of the given block label
pub fn validate_pem(value: &str, label: &str) -> Result<(), Error> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation(format!("{label} must not be empty")));
    }
    if !value.starts_with("-----BEGIN ") || !value.contains("-----END ") {
        return Err(Error::validation(format!("{label} is not PEM encoded")));
    }
    Ok(())
}

fn check_label(whole: &str, label: &str) -> Result<(), Error> {
    if label.is_empty() {
        return Err(Error::validation_for(whole, "name contains an empty segment"));
    }
    let valid_chars = label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !valid_chars {
        return Err(Error::validation_for(
            whole,
            "only lowercase alphanumerics, '-' and '.' are allowed",
        ));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(Error::validation_for(
            whole,
            "must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

/// The bare message of a validation error, without the resource prefix
pub(crate) fn reason(err: &Error) -> String {
    match err {
        Error::Validation { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
