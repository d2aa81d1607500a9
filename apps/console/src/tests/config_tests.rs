use std::collections::HashMap;

use super::*;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_point_at_the_local_collaborator() {
    let settings = Settings::default();
    assert_eq!(settings.server_url, "http://127.0.0.1:5000");
    assert_eq!(settings.refresh_interval(), Duration::from_secs(30));
    assert_eq!(settings.reconnect.policy(), ReconnectPolicy::default());
    assert_eq!(settings.log_filter, "info");
}

#[test]
fn file_values_override_defaults() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
server_url = "http://192.168.43.41:5000"
refresh_interval_secs = 10

[reconnect]
max_attempts = 3
"#,
    );

    assert_eq!(settings.server_url, "http://192.168.43.41:5000");
    assert_eq!(settings.refresh_interval_secs, 10);
    assert_eq!(settings.reconnect.max_attempts, 3);
    assert_eq!(settings.reconnect.initial_delay_ms, 500);
    assert_eq!(settings.log_filter, "info");
}

#[test]
fn malformed_file_is_ignored() {
    let mut settings = Settings::default();
    apply_file(&mut settings, "server_url = [not toml");
    assert_eq!(settings, Settings::default());
}

#[test]
fn app_prefixed_env_wins_over_plain_env() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        env(&[
            ("KIOSK_SERVER_URL", "http://10.0.0.2:5000"),
            ("APP__SERVER_URL", "http://10.0.0.3:5000"),
            ("APP__REFRESH_INTERVAL_SECS", "15"),
            ("APP__RECONNECT_MAX_ATTEMPTS", "not-a-number"),
            ("APP__LOG_FILTER", "client_core=debug"),
        ]),
    );

    assert_eq!(settings.server_url, "http://10.0.0.3:5000");
    assert_eq!(settings.refresh_interval_secs, 15);
    assert_eq!(settings.reconnect.max_attempts, 8);
    assert_eq!(settings.log_filter, "client_core=debug");
}

#[test]
fn cli_host_builds_url_with_port() {
    let mut settings = Settings::default();
    settings
        .override_server(None, Some("192.168.43.41".into()), 5000)
        .expect("override");
    let endpoint = settings.endpoint().expect("endpoint");
    assert_eq!(endpoint.rest("/api/students"), "http://192.168.43.41:5000/api/students");
}

#[test]
fn cli_server_url_beats_host() {
    let mut settings = Settings::default();
    settings
        .override_server(
            Some("https://kiosk.example:8443".into()),
            Some("ignored".into()),
            5000,
        )
        .expect("override");
    assert_eq!(settings.server_url, "https://kiosk.example:8443");
}

#[test]
fn unusable_server_url_is_reported() {
    let settings = Settings {
        server_url: "ftp://kiosk".into(),
        ..Settings::default()
    };
    assert!(settings.endpoint().is_err());
}

#[test]
fn zero_refresh_interval_is_clamped() {
    let settings = Settings {
        refresh_interval_secs: 0,
        ..Settings::default()
    };
    assert_eq!(settings.refresh_interval(), Duration::from_secs(1));
}
