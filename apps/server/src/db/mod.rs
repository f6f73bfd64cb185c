//! Database layer - resource store backends and the identity cache

pub mod compare;
pub mod identity_cache;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use identity_cache::{IdentityCache, PendingIdentities};
pub use memory::MemoryResourceStore;
pub use postgres::PostgresResourceStore;
pub use traits::{ResourceStore, StoreTransaction};

use crate::{Error, Result};
use meridian_search::{Chain, Modifier, QueryParameter, QueryParameterValue, QueryValue, SearchContext};

/// Roll back a transaction that is being abandoned. The original error is
/// what the caller reports, so a failed rollback is only logged.
pub(crate) async fn rollback(tx: Box<dyn StoreTransaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Rollback failed");
    }
}

/// Reject search features neither backend evaluates. Terminology backed
/// token modifiers need a terminology service.
pub fn check_supported(context: &SearchContext) -> Result<()> {
    context.parameters.iter().try_for_each(check_parameter)
}

fn check_parameter(param: &QueryParameter) -> Result<()> {
    if let Some(
        modifier @ (Modifier::Text | Modifier::In | Modifier::NotIn | Modifier::Above | Modifier::Below),
    ) = param.modifier
    {
        if param.param_type == meridian_search::SearchParamType::Token {
            return Err(Error::NotImplemented(format!(
                "Modifier ':{}' on token parameter '{}'",
                modifier, param.code
            )));
        }
    }
    match &param.chain {
        Some(Chain::Forward { next, .. }) | Some(Chain::Reverse { next, .. }) => check_parameter(next),
        None => Ok(()),
    }
}

/// Code under which the values a query value is matched against are
/// stored. Identifier derived tokens live under synthetic codes.
pub(crate) fn stored_code(param: &QueryParameter, value: &QueryParameterValue) -> String {
    match (&param.modifier, &value.value) {
        (Some(Modifier::Identifier), _) => format!("{}:identifier", param.code),
        (_, QueryValue::Token { of_type: Some(_), .. }) => format!("{}:of-type", param.code),
        _ => param.code.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_search::SearchParamType;

    #[test]
    fn terminology_modifiers_are_not_implemented() {
        let mut context = SearchContext::new(Some("Observation".into()), 10);
        let mut param = QueryParameter::new("code", SearchParamType::Token);
        param.modifier = Some(Modifier::In);
        context.parameters.push(param);
        assert!(matches!(check_supported(&context), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn chained_parameters_are_checked() {
        let mut inner = QueryParameter::new("code", SearchParamType::Token);
        inner.modifier = Some(Modifier::Text);
        let mut outer = QueryParameter::new("subject", SearchParamType::Reference);
        outer.chain = Some(Chain::Forward {
            target_type: "Patient".into(),
            next: Box::new(inner),
        });
        let mut context = SearchContext::new(Some("Observation".into()), 10);
        context.parameters.push(outer);
        assert!(check_supported(&context).is_err());

        let mut uri = QueryParameter::new("url", SearchParamType::Uri);
        uri.modifier = Some(Modifier::Below);
        let mut context = SearchContext::new(Some("ValueSet".into()), 10);
        context.parameters.push(uri);
        assert!(check_supported(&context).is_ok());
    }
}
