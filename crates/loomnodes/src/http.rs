use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Outbound HTTP call. The host guard runs before any network I/O: a
/// rejected host fails immediately without consuming retry budget.
pub struct HttpRequestNode;

#[async_trait]
impl Node for HttpRequestNode {
    fn spec_id(&self) -> &str {
        "http-request"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = ctx
            .input_or_config("url")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| NodeError::Configuration("http-request requires a url".into()))?;

        let parsed = reqwest::Url::parse(&url).map_err(|e| {
            NodeError::Configuration(format!("invalid url '{}': {}", url, e))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| NodeError::Configuration(format!("url has no host: {}", url)))?;

        let allow = config_host_list(&ctx, "allowHosts");
        let deny = config_host_list(&ctx, "denyHosts");
        check_host(host, &allow, &deny)?;

        let method = ctx
            .config_str("method")
            .unwrap_or_else(|| "GET".into())
            .to_uppercase();
        let timeout_ms = ctx
            .config
            .get("timeoutMs")
            .and_then(|v| v.as_f64())
            .unwrap_or(30_000.0) as u64;
        let follow_redirects = ctx
            .config
            .get("followRedirects")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(redirect)
            .build()
            .map_err(|e| NodeError::ExecutionFailed(format!("http client: {}", e)))?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = match method.as_str() {
            "GET" => client.get(parsed),
            "POST" => client.post(parsed),
            "PUT" => client.put(parsed),
            "PATCH" => client.patch(parsed),
            "DELETE" => client.delete(parsed),
            "HEAD" => client.head(parsed),
            other => {
                return Err(NodeError::Configuration(format!(
                    "unsupported method: {other}"
                )))
            }
        };

        if let Some(Value::Object(headers)) = ctx.config.get("headers") {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }
        // Side-effecting calls can carry an idempotency marker so provider
        // retries stay safe.
        if let Some(key) = ctx.config_str("idempotencyKey") {
            request = request.header("Idempotency-Key", key);
        }

        if let Some(body) = ctx.inputs.get("body").or_else(|| ctx.config.get("body")) {
            request = match body {
                Value::String(text) => request.body(text.clone()),
                other => request.json(&other.to_json()),
            };
        }

        let response = request.send().await.map_err(|e| {
            let retryable = e.is_timeout() || e.is_connect() || e.is_request();
            NodeError::provider(format!("HTTP request failed: {}", e), retryable)
        })?;

        let status = response.status().as_u16();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::provider(format!("Failed to read response: {}", e), true))?;

        ctx.events.info(format!("Response status: {}", status));

        Ok(NodeOutput::new()
            .with_output("output", body_text.clone())
            .with_output("body", body_text)
            .with_output("status", status as f64)
            .with_output("headers", Value::Object(headers_map)))
    }
}

fn config_host_list(ctx: &NodeContext, key: &str) -> Vec<String> {
    ctx.config
        .get(key)
        .and_then(|v| v.as_array_items())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Deny wins over everything; a configured allow-list then restricts what
/// remains. The default deny covers loopback, link-local, unspecified,
/// and private-range targets.
fn check_host(host: &str, allow: &[String], deny: &[String]) -> Result<(), NodeError> {
    let blocked = || {
        Err(NodeError::BlockedHost {
            host: host.to_string(),
        })
    };

    if deny.iter().any(|d| host_matches(host, d)) {
        return blocked();
    }
    if is_local_host(host) {
        return blocked();
    }
    if !allow.is_empty() && !allow.iter().any(|a| host_matches(host, a)) {
        return blocked();
    }
    Ok(())
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

fn is_local_host(host: &str) -> bool {
    let lowered = host.to_ascii_lowercase();
    if lowered == "localhost" || lowered.ends_with(".localhost") {
        return true;
    }
    // IPv6 hosts arrive bracketed in URLs.
    let bare = lowered.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || ip.is_link_local() || ip.is_private()
        }
        Ok(IpAddr::V6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (ip.segments()[0] & 0xffc0) == 0xfe80
                || (ip.segments()[0] & 0xfe00) == 0xfc00
        }
        Err(_) => false,
    }
}

pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(HttpRequestNode))
    }

    fn spec_id(&self) -> &str {
        "http-request"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Make an outbound HTTP request".to_string(),
            category: "network".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_with_ports;

    #[test]
    fn loopback_is_blocked_by_default() {
        assert!(matches!(
            check_host("127.0.0.1", &[], &[]),
            Err(NodeError::BlockedHost { .. })
        ));
        assert!(matches!(
            check_host("localhost", &[], &[]),
            Err(NodeError::BlockedHost { .. })
        ));
        assert!(matches!(
            check_host("[::1]", &[], &[]),
            Err(NodeError::BlockedHost { .. })
        ));
    }

    #[test]
    fn private_and_link_local_ranges_blocked() {
        for host in ["10.0.0.8", "192.168.1.1", "172.16.5.5", "169.254.169.254", "0.0.0.0"] {
            assert!(check_host(host, &[], &[]).is_err(), "{host} should be blocked");
        }
    }

    #[test]
    fn public_hosts_pass() {
        assert!(check_host("api.example.com", &[], &[]).is_ok());
        assert!(check_host("93.184.216.34", &[], &[]).is_ok());
    }

    #[test]
    fn allow_list_restricts() {
        let allow = vec!["example.com".to_string()];
        assert!(check_host("api.example.com", &allow, &[]).is_ok());
        assert!(check_host("example.com", &allow, &[]).is_ok());
        assert!(check_host("evil.com", &allow, &[]).is_err());
    }

    #[test]
    fn deny_list_wins_over_allow() {
        let allow = vec!["example.com".to_string()];
        let deny = vec!["bad.example.com".to_string()];
        assert!(check_host("bad.example.com", &allow, &deny).is_err());
        assert!(check_host("good.example.com", &allow, &deny).is_ok());
    }

    #[tokio::test]
    async fn blocked_host_error_is_not_retryable() {
        let mut ctx = context_with_ports(vec![]);
        ctx.config.insert(
            "url".into(),
            Value::String("http://127.0.0.1/admin".into()),
        );
        let err = HttpRequestNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::BlockedHost { .. }));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("blocked host"));
    }
}
