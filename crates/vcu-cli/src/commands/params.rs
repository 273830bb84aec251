//! Params command - list the parameter registry

use vcu_link::ParameterRegistry;

use crate::output::{OutputContext, ParameterRow};

pub fn params(registry: &ParameterRegistry, ctx: &OutputContext) {
    let rows: Vec<ParameterRow> = registry
        .iter()
        .map(|spec| ParameterRow {
            id: spec.id.clone(),
            name: spec.name.clone().unwrap_or_default(),
            request: format!("{} {}", spec.request.can_id, spec.request.payload_hex()),
            response: spec.response_can_id.to_string(),
            interval_ms: spec.request.interval_ms,
            unit: spec.unit.clone().unwrap_or_default(),
        })
        .collect();

    ctx.print(&rows);
}
