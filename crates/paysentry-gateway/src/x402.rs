//! x402-style wire types.
//!
//! Field names follow the protocol's camelCase JSON; amounts arrive as
//! stringified integers in base units and are converted by the adapter.

use serde::{Deserialize, Serialize};

/// A signed payment payload presented by the paying agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    /// Scheme-specific payload, opaque to the control plane
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// The paying agent, when the scheme exposes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// What the resource server demands for access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Stringified integer in base units (e.g. 1500000 = 1.5 USDC)
    pub max_amount_required: String,
    #[serde(default)]
    pub resource: String,
    pub pay_to: String,
    #[serde(default)]
    pub description: String,
}

/// Facilitator verification reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl VerifyResponse {
    pub fn valid(payer: Option<String>) -> Self {
        Self {
            is_valid: true,
            payer,
            invalid_reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            payer: None,
            invalid_reason: Some(reason.into()),
        }
    }
}

/// Facilitator settlement reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Schemes and networks the facilitator supports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedKinds {
    pub schemes: Vec<String>,
    pub networks: Vec<String>,
}

/// De-duplication key for a (payload, requirements) pair:
/// `x402:<payer>:<payTo>:<maxAmountRequired>`.
pub fn transaction_key(payload: &PaymentPayload, requirements: &PaymentRequirements) -> String {
    format!(
        "x402:{}:{}:{}",
        payload.payer.as_deref().unwrap_or("unknown"),
        requirements.pay_to,
        requirements.max_amount_required
    )
}
