//! Pure helpers that turn container metadata and query names into lookup keys.
//!
//! Every key handed to the registry is lower-case and carries no
//! reserved-domain suffix, so `web`, `Web.docker` and `web.docker.` all
//! address the same alias.

/// Strip the single leading `/` Docker puts in front of container names.
pub fn normalize_container_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Reduce an image reference to its bare repository name.
///
/// `registry:5000/org/app:1.2` becomes `app`: everything up to the last `/`
/// is dropped first, then the tag starting at the first `:`.
pub fn normalize_image_name(image: &str) -> &str {
    let base = image.rsplit_once('/').map_or(image, |(_, base)| base);
    base.split_once(':').map_or(base, |(name, _)| name)
}

/// Remove a trailing `.<domain>` (and a trailing root dot) from an alias.
///
/// The comparison ignores ASCII case. Aliases outside the domain are returned
/// unchanged apart from the root dot.
pub fn strip_domain<'a>(alias: &'a str, domain: &str) -> &'a str {
    let alias = alias.strip_suffix('.').unwrap_or(alias);
    let suffix_len = domain.len() + 1;
    if alias.len() <= suffix_len || !alias.is_char_boundary(alias.len() - suffix_len) {
        return alias;
    }
    let (head, tail) = alias.split_at(alias.len() - suffix_len);
    if tail.starts_with('.') && tail[1..].eq_ignore_ascii_case(domain) {
        head
    } else {
        alias
    }
}

/// Canonical registry key for a hostname: lower-cased, domain suffix removed.
pub fn normalize_hostname(hostname: &str, domain: &str) -> String {
    strip_domain(hostname, domain).to_ascii_lowercase()
}

/// Hostname part of a fully-qualified query name inside `domain`.
///
/// Returns `None` when the name is not strictly below the reserved domain.
pub fn hostname_in_domain(fqdn: &str, domain: &str) -> Option<String> {
    let fqdn = fqdn.strip_suffix('.').unwrap_or(fqdn);
    let stripped = strip_domain(fqdn, domain);
    if stripped.len() == fqdn.len() || stripped.is_empty() {
        return None;
    }
    Some(stripped.to_ascii_lowercase())
}
