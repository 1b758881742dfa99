//! Per-user message allowances

use crate::config::{EntitlementsConfig, UserKind};

/// Messages a user of `kind` may send per rolling 24 hours.
pub fn max_messages_per_day(config: &EntitlementsConfig, kind: UserKind) -> usize {
    match kind {
        UserKind::Guest => config.guest_messages_per_day,
        UserKind::Regular => config.regular_messages_per_day,
    }
}

/// Whether `sent` messages in the window exceed the user's allowance.
pub fn is_exceeded(config: &EntitlementsConfig, kind: UserKind, sent: usize) -> bool {
    sent > max_messages_per_day(config, kind)
}
