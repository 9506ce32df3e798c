//! Environment checks shared by `palaver doctor` and `GET /api/doctor`.

use serde::Serialize;

use palaver_domain::config::{Config, ConfigSeverity};

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

fn check(name: &str, ok: bool, detail: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.to_owned(),
        ok,
        detail: detail.into(),
    }
}

/// Static environment checks: config validity, storage writability,
/// provider credentials, memory wiring.
pub fn environment_checks(config: &Config) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    // Config validation issues.
    let issues = config.validate();
    let errors: Vec<String> = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .map(|i| i.to_string())
        .collect();
    checks.push(check(
        "config",
        errors.is_empty(),
        if errors.is_empty() {
            format!("{} warning(s)", issues.len() - errors.len())
        } else {
            errors.join("; ")
        },
    ));

    // Data dir writable.
    let data_dir = &config.storage.data_dir;
    let writable = std::fs::create_dir_all(data_dir)
        .and_then(|_| {
            let probe = data_dir.join(".doctor-probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        })
        .is_ok();
    checks.push(check(
        "storage",
        writable,
        format!("data dir {}", data_dir.display()),
    ));

    // Provider credentials.
    checks.push(check(
        "provider",
        config.api.api_key.is_some(),
        if config.api.api_key.is_some() {
            format!("{} @ {}", config.api.model, config.api.base_url)
        } else {
            "API__API_KEY not set".to_owned()
        },
    ));

    // Memory wiring.
    let memory_detail = if !config.memory.enabled {
        "disabled".to_owned()
    } else if config.memory.neo4j.enabled {
        format!("neo4j @ {}", config.memory.neo4j.uri)
    } else {
        "in-memory store".to_owned()
    };
    let memory_ok = !config.memory.enabled
        || !config.memory.neo4j.enabled
        || (!config.memory.neo4j.uri.is_empty() && config.memory.neo4j.password.is_some());
    checks.push(check("memory", memory_ok, memory_detail));

    checks
}

/// CLI entry: print the checks, return overall pass/fail.
pub fn run(config: &Config) -> bool {
    let checks = environment_checks(config);
    let mut all_ok = true;
    for c in &checks {
        let mark = if c.ok { "ok " } else { "FAIL" };
        println!("[{mark}] {:<10} {}", c.name, c.detail);
        all_ok &= c.ok;
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_except_provider_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");

        let checks = environment_checks(&config);
        let by_name = |n: &str| checks.iter().find(|c| c.name == n).unwrap();
        assert!(by_name("config").ok);
        assert!(by_name("storage").ok);
        assert!(!by_name("provider").ok); // no API key in the test env
        assert!(by_name("memory").ok); // disabled counts as healthy
    }

    #[test]
    fn neo4j_without_credentials_fails_memory_check() {
        let mut config = Config::default();
        config.memory.enabled = true;
        config.memory.neo4j.enabled = true;
        config.memory.neo4j.uri = "http://graph:7474".into();
        // no password
        let checks = environment_checks(&config);
        assert!(!checks.iter().find(|c| c.name == "memory").unwrap().ok);
    }
}
