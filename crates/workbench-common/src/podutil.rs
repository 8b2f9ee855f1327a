//! Keyed edits over pod spec collections
//!
//! Containers, volumes, volume mounts, and env vars are all lists keyed by
//! `name`. Every mutation the webhook performs is "replace the element with
//! this key, else append", which keeps repeated admission passes idempotent
//! and preserves the order of everything it does not touch.

use k8s_openapi::api::core::v1::{Container, EnvVar, Volume, VolumeMount};

/// Replace the container with the same name, else append
pub fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

/// Replace the volume with the same name, else append
pub fn upsert_volume(volumes: &mut Option<Vec<Volume>>, volume: Volume) {
    let volumes = volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

/// Replace the volume mount with the same name, else append
pub fn upsert_volume_mount(mounts: &mut Option<Vec<VolumeMount>>, mount: VolumeMount) {
    let mounts = mounts.get_or_insert_with(Vec::new);
    match mounts.iter_mut().find(|m| m.name == mount.name) {
        Some(existing) => *existing = mount,
        None => mounts.push(mount),
    }
}

/// Replace the env var with the same name, else append
pub fn upsert_env(env: &mut Option<Vec<EnvVar>>, var: EnvVar) {
    let env = env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Remove every env var whose name appears in `names`; true if any was removed
pub fn remove_env(env: &mut Option<Vec<EnvVar>>, names: &[&str]) -> bool {
    let Some(vars) = env.as_mut() else {
        return false;
    };
    let before = vars.len();
    vars.retain(|e| !names.contains(&e.name.as_str()));
    vars.len() != before
}

/// Remove the volume with the given name; true if it was present
pub fn remove_volume(volumes: &mut Option<Vec<Volume>>, name: &str) -> bool {
    let Some(vols) = volumes.as_mut() else {
        return false;
    };
    let before = vols.len();
    vols.retain(|v| v.name != name);
    vols.len() != before
}

/// Remove the volume mount with the given name; true if it was present
pub fn remove_volume_mount(mounts: &mut Option<Vec<VolumeMount>>, name: &str) -> bool {
    let Some(ms) = mounts.as_mut() else {
        return false;
    };
    let before = ms.len();
    ms.retain(|m| m.name != name);
    ms.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_env_replaces_in_place() {
        let mut vars = Some(vec![env("A", "1"), env("B", "2"), env("C", "3")]);

        upsert_env(&mut vars, env("B", "changed"));

        let vars = vars.unwrap();
        // Order preserved, value replaced
        let names: Vec<&str> = vars.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(vars[1].value.as_deref(), Some("changed"));
    }

    #[test]
    fn test_upsert_env_appends_when_absent() {
        let mut vars = None;
        upsert_env(&mut vars, env("NEW", "v"));
        assert_eq!(vars.unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_container_is_idempotent() {
        let mut containers = vec![Container {
            name: "main".to_string(),
            ..Default::default()
        }];

        let sidecar = Container {
            name: "oauth-proxy".to_string(),
            image: Some("proxy:v1".to_string()),
            ..Default::default()
        };

        upsert_container(&mut containers, sidecar.clone());
        upsert_container(&mut containers, sidecar);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].image.as_deref(), Some("proxy:v1"));
    }

    #[test]
    fn test_remove_env_reports_changes() {
        let mut vars = Some(vec![env("KEEP", "1"), env("DROP", "2")]);
        assert!(remove_env(&mut vars, &["DROP", "MISSING"]));
        assert!(!remove_env(&mut vars, &["DROP"]));
        assert_eq!(vars.unwrap().len(), 1);

        let mut empty = None;
        assert!(!remove_env(&mut empty, &["ANY"]));
    }

    #[test]
    fn test_remove_volume_and_mount() {
        let mut volumes = Some(vec![Volume {
            name: "trusted-ca".to_string(),
            ..Default::default()
        }]);
        assert!(remove_volume(&mut volumes, "trusted-ca"));
        assert!(!remove_volume(&mut volumes, "trusted-ca"));

        let mut mounts = Some(vec![VolumeMount {
            name: "trusted-ca".to_string(),
            mount_path: "/etc/pki".to_string(),
            ..Default::default()
        }]);
        assert!(remove_volume_mount(&mut mounts, "trusted-ca"));
        assert!(mounts.unwrap().is_empty());
    }
}
