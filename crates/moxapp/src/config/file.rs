use std::path::Path;

use anyhow::Context;

use super::model::TrafficConfig;

/// Read a YAML traffic configuration from disk. Unknown keys are ignored.
pub fn read_config_file(path: &Path) -> anyhow::Result<TrafficConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
enabled: true
global_multiplier: 0.5
concurrent_requests: 10
incoming_enabled: true

auth_configs:
  example_api:
    type: bearer
    token_endpoint:
      url: http://localhost:9000/oauth/token
      method: POST
      token_path: access_token
      expires_path: expires_in

outgoing_endpoints:
  - name: list-users
    method: GET
    url_template: "http://localhost:9000/users?seq={{randomInt 1 100}}"
    frequency: 120
    auth: example_api

incoming_routes:
  - name: orders
    path: /orders
    method: "*"
    responses:
      - status: 200
        share: 0.95
        min_response_ms: 5
        max_response_ms: 50
      - status: 503
        share: 0.05
        min_response_ms: 0
        max_response_ms: 0
"#;

    #[test]
    fn parses_a_full_sample() {
        let dir = std::env::temp_dir().join(format!("moxapp-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("endpoints.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut config = read_config_file(&path).unwrap();
        config.normalize();

        assert_eq!(config.global_multiplier, 0.5);
        assert_eq!(config.concurrent_requests, 10);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.incoming_routes.len(), 1);
        assert!(config.auth_configs.contains_key("example_api"));
        assert_eq!(config.auth_configs["example_api"].name, "example_api");
        assert!(config.validate().is_empty(), "{:?}", config.validate());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(read_config_file(Path::new("/nope/endpoints.yaml")).is_err());
    }
}
