use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::info;

use super::commands::{CallArgs, SendArgs};
use super::output::{print_value, OutputFormat};
use super::runtime::blocking;
use crate::app_context::AppContext;

/// `None` for a missing argument; anything else must be a JSON object.
pub fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("params must be valid JSON")?;
    if !value.is_object() {
        bail!("params must be a JSON object, got {value}");
    }
    Ok(Some(value))
}

pub async fn cmd_call(args: CallArgs, ctx: &Arc<AppContext>, output: OutputFormat) -> Result<()> {
    let params = parse_params(args.params.as_deref())?;
    let method = args.method.clone();
    let reply = blocking(ctx, move |ctx| {
        ctx.call(&method, params, args.timeout).map_err(anyhow::Error::from)
    })
    .await?;

    print_value(output, reply.as_value())?;
    if let Some(domain) = reply.domain_error() {
        bail!("{} returned an error: {}", args.method, domain.message);
    }
    Ok(())
}

pub async fn cmd_send(args: SendArgs, ctx: &Arc<AppContext>, output: OutputFormat) -> Result<()> {
    let params = parse_params(args.params.as_deref())?;
    let method = args.method.clone();
    let id = blocking(ctx, move |ctx| {
        ctx.send(&method, params).map_err(anyhow::Error::from)
    })
    .await?;
    print_value(output, &json!({ "id": id, "method": args.method }))
}

pub async fn cmd_ensure(relaunch: bool, ctx: &Arc<AppContext>, output: OutputFormat) -> Result<()> {
    let outcome = blocking(ctx, move |ctx| {
        ctx.ensure_browser(relaunch).map_err(anyhow::Error::from)
    })
    .await?;
    info!(?outcome, "browser ready");
    print_value(output, &outcome)
}

pub async fn cmd_targets(ctx: &Arc<AppContext>, output: OutputFormat) -> Result<()> {
    let targets = blocking(ctx, |ctx| ctx.targets().map_err(anyhow::Error::from)).await?;
    if output == OutputFormat::Human {
        for target in &targets {
            let field = |name: &str| target.get(name).and_then(Value::as_str).unwrap_or("-");
            println!("{:<8} {:<40} {}", field("type"), field("id"), field("url"));
        }
        return Ok(());
    }
    print_value(output, &targets)
}

pub async fn cmd_new_page(ctx: &Arc<AppContext>, output: OutputFormat) -> Result<()> {
    let target_id = blocking(ctx, |ctx| ctx.new_page().map_err(anyhow::Error::from)).await?;
    if output == OutputFormat::Human {
        println!("{target_id}");
        return Ok(());
    }
    print_value(output, &json!({ "targetId": target_id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_must_be_an_object() {
        assert!(parse_params(None).unwrap().is_none());
        assert!(parse_params(Some("  ")).unwrap().is_none());
        assert_eq!(
            parse_params(Some(r#"{"url":"about:blank"}"#)).unwrap(),
            Some(json!({"url": "about:blank"}))
        );
        assert!(parse_params(Some("[1,2]")).is_err());
        assert!(parse_params(Some("{nope")).is_err());
    }
}
