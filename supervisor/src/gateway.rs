//! Rendering and validation of the reverse-proxy gateway configuration.
//!
//! The rendered file is a pure function of the deployment config: upstream
//! groups and location blocks come out in ascending server-name order,
//! REST locations follow each server's declared module order, and ports
//! within an upstream ascend. Equal configs render byte-identical files.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

use crate::config::{DeploymentConfig, RoutingStrategy};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The rendered config could not be written.
    #[error("failed to write gateway config {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The gateway binary could not be executed at all.
    #[error("failed to run gateway binary {bin}: {source}")]
    Exec {
        bin: String,
        source: std::io::Error,
    },

    /// The gateway's own config check rejected the rendered file.
    #[error("gateway config validation failed: {0}")]
    ValidationFailed(String),
}

/// Variable the `query_param` strategy maps the routing parameter into.
const WS_UPSTREAM_VAR: &str = "$websocket_upstream";

/// Renders the gateway config for `config`.
///
/// `pid_path` is where the gateway is told to write its master PID and
/// `log_dir` holds the access/error logs.
pub fn render(config: &DeploymentConfig, pid_path: &Path, log_dir: &Path) -> String {
    let mut out = String::new();
    let base = config.api_prefix();

    out.push_str(&format!(
        "worker_processes {};\n",
        config.gateway.worker_processes
    ));
    out.push_str(&format!("pid {};\n", pid_path.display()));
    out.push_str(&format!(
        "error_log {};\n",
        log_dir.join("gateway-error.log").display()
    ));
    out.push('\n');
    out.push_str("events {\n");
    out.push_str(&format!(
        "    worker_connections {};\n",
        config.gateway.worker_connections
    ));
    out.push_str("}\n\n");

    out.push_str("http {\n");
    out.push_str(&format!(
        "    access_log {};\n",
        log_dir.join("gateway-access.log").display()
    ));

    // One upstream group per server, one endpoint per instance.
    for (name, server) in &config.servers {
        out.push('\n');
        out.push_str(&format!("    upstream {name} {{\n"));
        for k in 0..server.instances {
            out.push_str(&format!("        server 127.0.0.1:{};\n", server.port + k));
        }
        out.push_str("    }\n");
    }

    if config.websocket.routing_strategy == RoutingStrategy::QueryParam {
        // Validated at load: the param name is present for this strategy.
        let param = config.websocket.query_param_name.as_deref().unwrap_or("");
        out.push('\n');
        out.push_str(&format!("    map $arg_{param} {WS_UPSTREAM_VAR} {{\n"));
        for (module, server) in &config.websocket_routes {
            out.push_str(&format!("        {module} {server};\n"));
        }
        out.push_str("    }\n");
    }

    out.push('\n');
    out.push_str("    server {\n");
    out.push_str(&format!(
        "        listen 127.0.0.1:{};\n",
        config.gateway.port
    ));

    for (name, server) in &config.servers {
        for module in &server.modules {
            out.push('\n');
            out.push_str(&format!("        location {base}/{module}/ {{\n"));
            out.push_str(&format!("            proxy_pass http://{name};\n"));
            push_forward_headers(&mut out);
            out.push_str("        }\n");
        }
    }

    match config.websocket.routing_strategy {
        RoutingStrategy::Path => {
            for (module, server) in &config.websocket_routes {
                out.push('\n');
                out.push_str(&format!("        location {base}/{module}/ws {{\n"));
                out.push_str(&format!("            proxy_pass http://{server};\n"));
                push_upgrade_headers(&mut out);
                out.push_str("        }\n");
            }
        }
        RoutingStrategy::QueryParam => {
            out.push('\n');
            out.push_str(&format!("        location {base}/ws {{\n"));
            out.push_str(&format!(
                "            proxy_pass http://{WS_UPSTREAM_VAR};\n"
            ));
            push_upgrade_headers(&mut out);
            out.push_str("        }\n");
        }
    }

    out.push_str("    }\n");
    out.push_str("}\n");
    out
}

fn push_forward_headers(out: &mut String) {
    out.push_str("            proxy_set_header Host $host;\n");
    out.push_str("            proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("            proxy_set_header X-Forwarded-Proto $scheme;\n");
}

fn push_upgrade_headers(out: &mut String) {
    out.push_str("            proxy_http_version 1.1;\n");
    out.push_str("            proxy_set_header Upgrade $http_upgrade;\n");
    out.push_str("            proxy_set_header Connection \"upgrade\";\n");
    out.push_str("            proxy_set_header Host $host;\n");
    out.push_str("            proxy_read_timeout 3600s;\n");
    out.push_str("            proxy_send_timeout 3600s;\n");
}

/// Writes the rendered config atomically (tmp file + rename) so a running
/// gateway never observes a torn file.
pub fn write_config(path: &Path, contents: &str) -> Result<(), GatewayError> {
    let tmp = path.with_extension("tmp");
    let write = |p: &Path, c: &str| {
        std::fs::write(p, c).map_err(|source| GatewayError::Write {
            path: p.to_path_buf(),
            source,
        })
    };
    write(&tmp, contents)?;
    std::fs::rename(&tmp, path).map_err(|source| GatewayError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs the gateway binary in config-check mode against `config_path`.
pub async fn check(gateway_bin: &Path, config_path: &Path) -> Result<(), GatewayError> {
    let output = Command::new(gateway_bin)
        .arg("-t")
        .arg("-c")
        .arg(config_path)
        .output()
        .await
        .map_err(|source| GatewayError::Exec {
            bin: gateway_bin.display().to_string(),
            source,
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(GatewayError::ValidationFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentConfig;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn config(yaml: &str) -> DeploymentConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn render_default(config: &DeploymentConfig) -> String {
        render(
            config,
            &PathBuf::from("/run/pids/gateway.pid"),
            &PathBuf::from("/run/logs"),
        )
    }

    const PATH_STRATEGY: &str = r#"
gateway:
  port: 8000
servers:
  svc-a:
    port: 8001
    instances: 2
    modules: [core, alpha]
  svc-b:
    port: 8003
    instances: 1
    modules: [beta]
websocket:
  routing_strategy: path
websocket_routes:
  alpha: svc-a
  beta: svc-b
"#;

    #[test]
    fn rendering_is_deterministic() {
        let config = config(PATH_STRATEGY);
        assert_eq!(render_default(&config), render_default(&config));
    }

    #[test]
    fn upstreams_are_ordered_by_server_then_port() {
        let rendered = render_default(&config(PATH_STRATEGY));
        let a = rendered.find("upstream svc-a {").unwrap();
        let b = rendered.find("upstream svc-b {").unwrap();
        assert!(a < b);

        let p1 = rendered.find("server 127.0.0.1:8001;").unwrap();
        let p2 = rendered.find("server 127.0.0.1:8002;").unwrap();
        assert!(p1 < p2);
    }

    #[test]
    fn rest_locations_follow_declared_module_order() {
        let rendered = render_default(&config(PATH_STRATEGY));
        let core = rendered.find("location /api/v1/core/ {").unwrap();
        let alpha = rendered.find("location /api/v1/alpha/ {").unwrap();
        let beta = rendered.find("location /api/v1/beta/ {").unwrap();
        assert!(core < alpha && alpha < beta);

        // Reordering a server's module list reorders only that server's
        // REST blocks.
        let swapped = config(&PATH_STRATEGY.replace("[core, alpha]", "[alpha, core]"));
        let rendered = render_default(&swapped);
        let core = rendered.find("location /api/v1/core/ {").unwrap();
        let alpha = rendered.find("location /api/v1/alpha/ {").unwrap();
        let beta = rendered.find("location /api/v1/beta/ {").unwrap();
        assert!(alpha < core && core < beta);
    }

    #[test]
    fn rest_locations_carry_forward_headers() {
        let rendered = render_default(&config(PATH_STRATEGY));
        for header in [
            "proxy_set_header Host $host;",
            "proxy_set_header X-Real-IP $remote_addr;",
            "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
            "proxy_set_header X-Forwarded-Proto $scheme;",
        ] {
            assert!(rendered.contains(header), "missing {header}");
        }
    }

    #[test]
    fn path_strategy_emits_per_module_ws_locations() {
        let rendered = render_default(&config(PATH_STRATEGY));
        assert!(rendered.contains("location /api/v1/alpha/ws {"));
        assert!(rendered.contains("location /api/v1/beta/ws {"));
        assert!(rendered.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(rendered.contains("proxy_read_timeout 3600s;"));
        assert!(!rendered.contains("map $arg_"));
    }

    #[test]
    fn query_param_strategy_emits_map_and_single_location() {
        let yaml = PATH_STRATEGY.replace(
            "routing_strategy: path",
            "routing_strategy: query_param\n  query_param_name: module",
        );
        let rendered = render_default(&config(&yaml));
        assert!(rendered.contains("map $arg_module $websocket_upstream {"));
        assert!(rendered.contains("        alpha svc-a;\n"));
        assert!(rendered.contains("        beta svc-b;\n"));
        assert!(rendered.contains("location /api/v1/ws {"));
        assert!(rendered.contains("proxy_pass http://$websocket_upstream;"));
        assert!(!rendered.contains("location /api/v1/alpha/ws"));
    }

    #[test]
    fn gateway_directives_present() {
        let rendered = render_default(&config(PATH_STRATEGY));
        assert!(rendered.starts_with("worker_processes 1;\n"));
        assert!(rendered.contains("pid /run/pids/gateway.pid;"));
        assert!(rendered.contains("error_log /run/logs/gateway-error.log;"));
        assert!(rendered.contains("access_log /run/logs/gateway-access.log;"));
        assert!(rendered.contains("worker_connections 1024;"));
        assert!(rendered.contains("listen 127.0.0.1:8000;"));
        assert!(rendered.ends_with("}\n"));
    }

    #[test]
    fn written_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.conf");
        let rendered = render_default(&config(PATH_STRATEGY));
        write_config(&path, &rendered).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), rendered);
        assert!(!path.with_extension("tmp").exists());
    }

    fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn check_accepts_a_config_the_gateway_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("gateway.conf");
        write_config(&conf, &render_default(&config(PATH_STRATEGY))).unwrap();

        let ok = write_script(dir.path(), "gateway-ok", "#!/bin/sh\nexit 0\n");
        check(&ok, &conf).await.unwrap();
    }

    #[tokio::test]
    async fn check_surfaces_the_gateway_rejection_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("gateway.conf");
        write_config(&conf, &render_default(&config(PATH_STRATEGY))).unwrap();

        let bad = write_script(
            dir.path(),
            "gateway-bad",
            "#!/bin/sh\necho 'unknown directive \"location\"' >&2\nexit 1\n",
        );
        let err = check(&bad, &conf).await.unwrap_err();
        assert_matches!(
            err,
            GatewayError::ValidationFailed(msg) if msg.contains("unknown directive")
        );
    }

    #[tokio::test]
    async fn check_with_missing_binary_is_an_exec_error() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("gateway.conf");
        write_config(&conf, &render_default(&config(PATH_STRATEGY))).unwrap();

        let err = check(Path::new("/nonexistent/nginx"), &conf)
            .await
            .unwrap_err();
        assert_matches!(err, GatewayError::Exec { .. });
    }
}
