use anyhow::{bail, Context, Result};
use reqwest::{Client, Method, Response};
use serde_json::Value;

use super::commands::{InstancesAction, InstancesArgs};
use super::output::{print_value, OutputFormat};
use crate::config::AppConfig;

/// Registry instances live inside a `cdpctl serve` process; these commands
/// drive its HTTP API.
pub async fn cmd_instances(args: InstancesArgs, config: &AppConfig, output: OutputFormat) -> Result<()> {
    let base = server_url(args.server.as_deref(), config);
    let client = Client::new();
    match args.action {
        InstancesAction::Launch { count } => {
            let mut launched = Vec::with_capacity(count as usize);
            for _ in 0..count {
                launched.push(request(&client, Method::POST, &format!("{base}/instances")).await?);
            }
            print_value(output, &launched)
        }
        InstancesAction::List => {
            let list = request(&client, Method::GET, &format!("{base}/instances")).await?;
            if output == OutputFormat::Human {
                print_table(&list);
                return Ok(());
            }
            print_value(output, &list)
        }
        InstancesAction::Kill { id, force } => {
            let url = format!("{base}/instances/{id}?force={force}");
            let body = request(&client, Method::DELETE, &url).await?;
            print_value(output, &body)
        }
        InstancesAction::Stats => {
            let stats = request(&client, Method::GET, &format!("{base}/stats")).await?;
            print_value(output, &stats)
        }
    }
}

pub fn server_url(explicit: Option<&str>, config: &AppConfig) -> String {
    match explicit {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!("http://{}:{}", config.http.bind, config.http.port),
    }
}

async fn request(client: &Client, method: Method, url: &str) -> Result<Value> {
    let response = client
        .request(method.clone(), url)
        .send()
        .await
        .with_context(|| format!("{method} {url}; is `cdpctl serve` running?"))?;
    decode(response).await
}

async fn decode(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.context("decoding control API response")?;
    if !status.is_success() {
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        bail!("{status}: {message}");
    }
    Ok(body)
}

fn print_table(list: &Value) {
    let Some(items) = list.as_array() else {
        println!("{list}");
        return;
    };
    if items.is_empty() {
        println!("no instances");
        return;
    }
    println!("{:<4} {:<8} {:<6} {:<9} {:>8} {:>9}", "ID", "PID", "PORT", "STATUS", "RESTARTS", "RSS(MB)");
    for item in items {
        let num = |name: &str| item.get(name).and_then(Value::as_u64);
        println!(
            "{:<4} {:<8} {:<6} {:<9} {:>8} {:>9}",
            num("instance_id").unwrap_or_default(),
            num("pid").map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
            num("debug_port").unwrap_or_default(),
            item.get("status").and_then(Value::as_str).unwrap_or("-"),
            num("restart_count").unwrap_or_default(),
            num("memory_usage_mb").unwrap_or_default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_defaults_to_http_config() {
        let mut config = AppConfig::default();
        assert_eq!(server_url(None, &config), "http://127.0.0.1:8080");
        config.http.port = 9100;
        assert_eq!(server_url(None, &config), "http://127.0.0.1:9100");
        assert_eq!(
            server_url(Some("http://10.0.0.2:8080/"), &config),
            "http://10.0.0.2:8080"
        );
    }
}
