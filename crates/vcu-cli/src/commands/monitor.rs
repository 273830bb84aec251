//! Monitor command - poll parameters until interrupted

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use vcu_link::{ParameterRegistry, Session, UpdateSink};

use crate::output::{OutputContext, UpdateRow};

/// Poll `params` (or the whole registry) and print every update
pub async fn monitor(
    session: &Session,
    registry: &ParameterRegistry,
    params: &[String],
    ctx: &OutputContext,
) -> Result<()> {
    let ids: Vec<String> = if params.is_empty() {
        registry.ids().map(String::from).collect()
    } else {
        params.to_vec()
    };
    if ids.is_empty() {
        bail!("The parameter registry is empty");
    }

    let (tx, mut updates) = mpsc::unbounded_channel::<(String, Value)>();
    let sink: Arc<dyn UpdateSink> = Arc::new(move |parameter_id: &str, value: &Value| {
        let _ = tx.send((parameter_id.to_string(), value.clone()));
    });
    session.start_polling(&ids, registry, sink)?;

    ctx.info(&format!(
        "Polling {} parameter(s) on {}",
        ids.len(),
        session.describe()
    ));
    ctx.info("Press Ctrl+C to stop");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    ctx.print_stream_header::<UpdateRow>();

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Some((parameter, value)) => print_update(&parameter, &value, registry, ctx),
                    None => break,
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                if !session.is_connected() {
                    ctx.error("Connection lost");
                    break;
                }
            }
        }
    }

    ctx.info("\nStopping polling...");
    session.stop_all_polling();
    ctx.success("Polling stopped");

    Ok(())
}

fn print_update(parameter: &str, value: &Value, registry: &ParameterRegistry, ctx: &OutputContext) {
    let unit = registry
        .get(parameter)
        .and_then(|spec| spec.unit.clone())
        .unwrap_or_default();
    let row = UpdateRow::new(
        chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
        parameter,
        value,
        unit,
    );

    let line = format!(
        "[{}] {} = {} {}",
        row.timestamp, row.parameter, row.rendered, row.unit
    );
    ctx.print_stream_row(&row, line.trim_end());
}
