//! Task result caching.

use async_trait::async_trait;
use chrono::Duration;
use marigold_schemas::StateType;
use tracing::debug;

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::rule::{OrchestrationRule, RuleScope, StateSet};

/// Short-circuits a task to an earlier COMPLETED result with the same cache key.
pub struct RetrieveCachedState;

#[async_trait]
impl OrchestrationRule for RetrieveCachedState {
  fn name(&self) -> &'static str {
    "RetrieveCachedState"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(StateSet::All, StateSet::Only(&[StateType::Running]))
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let details = &ctx.proposed_state.state_details;
    if details.refresh_cache {
      return Ok(());
    }
    let Some(cache_key) = details.cache_key.clone() else {
      return Ok(());
    };

    let Some(cached) = ctx.store().read_cached_state(&cache_key, ctx.now).await? else {
      return Ok(());
    };
    debug!(run_id = %ctx.run.id, cache_key = %cache_key, cached_state_id = %cached.id, "cache_hit");
    ctx.reject_transition(cached.fresh_copy(), "Retrieved state from cache");
    Ok(())
  }
}

/// Stamps the default expiration on cacheable COMPLETED states.
pub struct InsertCacheExpiration;

#[async_trait]
impl OrchestrationRule for InsertCacheExpiration {
  fn name(&self) -> &'static str {
    "InsertCacheExpiration"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(StateSet::All, StateSet::Only(&[StateType::Completed]))
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let Some(ttl) = ctx.settings().default_cache_ttl_seconds else {
      return Ok(());
    };
    let now = ctx.now;
    let details = &mut ctx.proposed_state.state_details;
    if details.cache_key.is_some() && details.cache_expiration.is_none() {
      let ttl = i64::try_from(ttl).unwrap_or(i64::MAX / 1000);
      details.cache_expiration = Some(now + Duration::seconds(ttl));
    }
    Ok(())
  }
}
