// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Defaults applied to every new resource.

use async_trait::async_trait;

use ecloud_core::lifecycle::{HookContext, HookOutcome, Reaction};

/// Names unnamed resources after their ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultName;

#[async_trait]
impl Reaction for DefaultName {
    fn name(&self) -> &'static str {
        "default_name"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> ecloud_core::Result<HookOutcome> {
        if ctx.resource.name.as_deref().is_none_or(str::is_empty) {
            ctx.resource.name = Some(ctx.resource.id.clone());
        }
        Ok(HookOutcome::Continue)
    }
}
