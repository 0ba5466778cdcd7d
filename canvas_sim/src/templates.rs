//! Agent templates - starting code, balance and role for new agents.

use crate::error::SimError;
use canvas_core::AgentSpec;
use canvas_env::AgentRole;
use serde::Deserialize;
use serde_json::Value;

/// Default requester budget per purchase (10 units).
pub const DEFAULT_PRICE_MICRO: u64 = 10_000_000;

/// Buys from `state.provider`, commits funds, pays on delivery.
///
/// State keys: `provider` (agent id), `price`, `rounds` (purchases to make),
/// `dispute_first` (dispute each delivery once before paying).
pub const REQUESTER_SCRIPT: &str = r#"
fn on_tick(api) {
    let s = api.state;
    let price = if "price" in s { s.price } else { 10000000 };
    let rounds = if "rounds" in s { s.rounds } else { 1 };
    let bought = if "bought" in s { s.bought } else { 0 };
    let open = 0;

    for tx in api.transactions {
        if tx.state == "INITIATED" || tx.state == "QUOTED" {
            if api.agent.balanceMicro >= tx.amountMicro {
                api.transition_state(tx.id, "COMMITTED");
            } else {
                api.warn("cannot afford tx " + tx.id + ", cancelling");
                api.cancel(tx.id);
            }
            open += 1;
        } else if tx.state == "DELIVERED" {
            if "dispute_first" in s && s.dispute_first {
                api.dispute(tx.id, "output failed review");
            } else {
                api.release_escrow(tx.id);
            }
            open += 1;
        } else if tx.state == "DISPUTED" {
            api.log("resolving dispute on tx " + tx.id);
            api.release_escrow(tx.id);
            open += 1;
        } else if tx.state != "SETTLED" && tx.state != "CANCELLED" {
            open += 1;
        }
    }

    if open == 0 && "provider" in s && bought < rounds {
        if api.agent.balanceMicro >= price {
            api.create_transaction(s.provider, price, "Data Analysis");
            s.bought = bought + 1;
        }
    }

    api.state = s;
}
"#;

/// Works committed jobs: start, publish the job, deliver.
pub const PROVIDER_SCRIPT: &str = r#"
fn on_tick(api) {
    let s = api.state;
    let delivered = if "delivered" in s { s.delivered } else { 0 };

    for tx in api.incoming {
        if tx.state == "COMMITTED" {
            api.transition_state(tx.id, "IN_PROGRESS");
        } else if tx.state == "IN_PROGRESS" {
            api.submit_job(tx.id, #{ service: tx.service, status: "done", at: api.now });
            api.transition_state(tx.id, "DELIVERED");
            delivered += 1;
        }
    }

    s.delivered = delivered;
    api.state = s;
}
"#;

/// Observer: counts ticks and logs a heartbeat.
pub const VALIDATOR_SCRIPT: &str = r#"
fn on_tick(api) {
    let s = api.state;
    let checks = if "checks" in s { s.checks + 1 } else { 1 };
    s.checks = checks;
    if checks % 5 == 0 {
        api.log("heartbeat " + checks + " at " + api.now + "ms");
    }
    api.state = s;
}
"#;

/// Static template content.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTemplate {
    pub id: String,
    /// Display name used when no customization overrides it
    pub name: String,
    pub role: AgentRole,
    pub initial_balance_micro: u64,
    pub default_code: String,
}

/// Source of agent templates.
pub trait TemplateLibrary {
    fn get_template(&self, id: &str) -> Option<AgentTemplate>;

    /// Ids of every template the library knows.
    fn template_ids(&self) -> Vec<String>;
}

/// Overrides applied on top of a template.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Customizations {
    pub name: Option<String>,
    pub balance_micro: Option<u64>,
    pub initial_state: Option<Value>,
    pub code: Option<String>,
}

impl Customizations {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_balance(mut self, balance_micro: u64) -> Self {
        self.balance_micro = Some(balance_micro);
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Builds an agent spec from a template plus overrides.
pub fn create_agent_from_template<L: TemplateLibrary + ?Sized>(
    library: &L,
    template_id: &str,
    customizations: Customizations,
) -> Result<AgentSpec, SimError> {
    let template = library
        .get_template(template_id)
        .ok_or_else(|| SimError::UnknownTemplate(template_id.to_string()))?;

    Ok(AgentSpec {
        name: customizations.name.unwrap_or(template.name),
        role: template.role,
        balance_micro: customizations
            .balance_micro
            .unwrap_or(template.initial_balance_micro),
        code: customizations.code.unwrap_or(template.default_code),
        initial_state: customizations.initial_state.unwrap_or(Value::Null),
    })
}

/// The built-in `requester`, `provider` and `validator` templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

impl TemplateLibrary for BuiltinTemplates {
    fn get_template(&self, id: &str) -> Option<AgentTemplate> {
        let (name, role, balance, code) = match id {
            "requester" => ("Requester", AgentRole::Requester, 50_000_000, REQUESTER_SCRIPT),
            "provider" => ("Provider", AgentRole::Provider, 0, PROVIDER_SCRIPT),
            "validator" => ("Validator", AgentRole::Validator, 0, VALIDATOR_SCRIPT),
            _ => return None,
        };
        Some(AgentTemplate {
            id: id.to_string(),
            name: name.to_string(),
            role,
            initial_balance_micro: balance,
            default_code: code.to_string(),
        })
    }

    fn template_ids(&self) -> Vec<String> {
        ["requester", "provider", "validator"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}
