use core_types::{Decision, PriceOracle, ProjectionSnapshot, RejectReason, SimulatedResponse};
use serde_json::Value;

/// Response variable carrying the predicted profit, in units of the instance's profit asset.
pub const PROFIT_VAR: &str = "profit";

/// Acceptance policy for a simulated arbitrage request sent to `instance`.
///
/// `snapshot` is the post-simulation projection. Checks run in a fixed order: bounce, negative
/// balance, profit threshold.
pub fn evaluate(
    instance: &str,
    responses: &[SimulatedResponse],
    snapshot: &ProjectionSnapshot,
    profit_asset: &str,
    min_profit: Option<f64>,
    oracle: &dyn PriceOracle,
) -> Decision {
    let Some(first) = responses.first() else {
        return Decision::Reject(RejectReason::WouldBounce {
            error: "no response".to_string(),
        });
    };
    if first.bounced {
        return Decision::Reject(RejectReason::WouldBounce {
            error: first
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    if let Some((asset, balance)) = snapshot.negative_balance(instance) {
        return Decision::Reject(RejectReason::NegativeBalance { asset, balance });
    }

    let profit_reference = predicted_profit(instance, responses)
        .and_then(|profit| oracle.to_reference(profit_asset, profit))
        .filter(|profit| profit.is_finite());
    let Some(threshold) = min_profit else {
        return Decision::Accept { profit_reference };
    };
    match profit_reference {
        None => Decision::Reject(RejectReason::ProfitUnknown),
        Some(profit) if profit < threshold => {
            Decision::Reject(RejectReason::ProfitTooSmall { profit, threshold })
        }
        Some(profit) => Decision::Accept {
            profit_reference: Some(profit),
        },
    }
}

/// Profit reported by the first successful response of `instance`. Non-finite values such as
/// `"NaN"` or `"inf"` count as unknown.
pub fn predicted_profit(instance: &str, responses: &[SimulatedResponse]) -> Option<f64> {
    let response = responses
        .iter()
        .find(|r| r.address == instance && !r.bounced)?;
    let profit = match response.response_vars.get(PROFIT_VAR)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    profit.filter(|p| p.is_finite())
}
