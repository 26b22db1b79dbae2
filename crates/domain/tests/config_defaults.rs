use selfserve_domain::config::Config;

#[test]
fn default_router_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.router.host, "127.0.0.1");
}

#[test]
fn explicit_zero_host_parses() {
    let toml_str = r#"
[router]
host = "0.0.0.0"
port = 8080
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.router.host, "0.0.0.0");
}

#[test]
fn service_ports_do_not_collide_by_default() {
    let config = Config::default();
    let ports = [config.router.port, config.worker.port, config.dispatcher.port];
    assert_eq!(
        ports.len(),
        ports.iter().collect::<std::collections::HashSet<_>>().len()
    );
}
