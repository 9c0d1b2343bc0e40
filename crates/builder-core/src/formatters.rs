use std::collections::BTreeMap;

/// Field manager used for server-side apply and the managed-by label.
pub const MANAGER: &str = "builder-controller";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const BUILD_REQUEST_LABEL: &str = "builder.io/build-request";

/// Label values and Job names stop at 63 characters.
const NAME_LIMIT: usize = 63;
const LONGEST_SUFFIX: &str = "-context";

/// Longest BuildRequest name whose derived Job, ConfigMap and label still fit.
pub const MAX_BUILD_REQUEST_NAME_LEN: usize = NAME_LIMIT - LONGEST_SUFFIX.len();

pub fn fits_derived_names(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_BUILD_REQUEST_NAME_LEN
}

pub fn format_build_job_name(name: &str) -> String {
    format!("{name}-build")
}

pub fn format_context_config_map_name(name: &str) -> String {
    format!("{name}{LONGEST_SUFFIX}")
}

/// Label selector matching every Job this controller creates.
pub fn format_managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGER}")
}

pub fn build_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
        (BUILD_REQUEST_LABEL.to_string(), name.to_string()),
    ])
}

/// generate push destination like `registry.local:5000/web:1.0`
pub fn format_image_destination(registry: &str, build_name: &str) -> String {
    let registry = registry.trim_end_matches('/');
    if registry.is_empty() {
        build_name.to_string()
    } else {
        format!("{registry}/{build_name}")
    }
}

pub fn format_pull_path(destination: &str, digest: Option<&str>) -> String {
    match digest.map(str::trim).filter(|d| !d.is_empty()) {
        Some(digest) => format!("{destination}@{digest}"),
        None => destination.to_string(),
    }
}

/// Tag part of a `name:tag` build name, `latest` when absent.
pub fn format_image_tag(build_name: &str) -> &str {
    let last_segment = build_name.rsplit('/').next().unwrap_or(build_name);
    match last_segment.split_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag,
        _ => "latest",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_derive_from_the_request() {
        assert_eq!(format_build_job_name("b1"), "b1-build");
        assert_eq!(format_context_config_map_name("b1"), "b1-context");
        assert_eq!(
            format_managed_selector(),
            "app.kubernetes.io/managed-by=builder-controller"
        );
    }

    #[test]
    fn long_names_do_not_fit_derived_names() {
        let longest = "b".repeat(MAX_BUILD_REQUEST_NAME_LEN);
        assert!(fits_derived_names(&longest));
        assert_eq!(format_context_config_map_name(&longest).len(), 63);
        assert!(format_build_job_name(&longest).len() <= 63);

        assert!(!fits_derived_names(&format!("{longest}x")));
        assert!(!fits_derived_names(""));
    }

    #[test]
    fn labels_route_back_to_the_request() {
        let labels = build_labels("b1");
        assert_eq!(labels.get(BUILD_REQUEST_LABEL).map(String::as_str), Some("b1"));
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGER));
    }

    #[test]
    fn destination_and_pull_path() {
        let destination = format_image_destination("registry.local:5000/", "web:1.0");
        assert_eq!(destination, "registry.local:5000/web:1.0");
        assert_eq!(format_image_destination("", "web"), "web");

        assert_eq!(
            format_pull_path(&destination, Some("sha256:abc")),
            "registry.local:5000/web:1.0@sha256:abc"
        );
        assert_eq!(format_pull_path(&destination, Some("  ")), destination);
        assert_eq!(format_pull_path(&destination, None), destination);
    }

    #[test]
    fn image_tag_ignores_registry_ports() {
        assert_eq!(format_image_tag("web:1.0"), "1.0");
        assert_eq!(format_image_tag("web"), "latest");
        assert_eq!(format_image_tag("registry.local:5000/team/web"), "latest");
        assert_eq!(format_image_tag("registry.local:5000/team/web:2"), "2");
    }
}
