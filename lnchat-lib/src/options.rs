//! Per-message options and their override rules.

use serde::{Deserialize, Serialize};

use crate::Amount;

/// Options applied to one outgoing message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Maximum routing fee per payment; zero means "not set".
    pub fee_limit: Amount,
    /// Send without sender and signature records.
    pub anonymous: bool,
}

impl MessageOptions {
    pub fn new(fee_limit: Amount, anonymous: bool) -> Self {
        Self {
            fee_limit,
            anonymous,
        }
    }
}

/// Fold `overrides` onto `base`.
///
/// `anonymous` comes from the last override. A non-zero `fee_limit` replaces
/// the running value when it does not exceed `base.fee_limit`, or always when
/// `allow_relax` is set. With no overrides `base` is returned unchanged.
///
/// # Example
///
/// ```
/// use lnchat_lib::{override_options, Amount, MessageOptions};
///
/// let base = MessageOptions::new(Amount(3000), false);
/// let out = override_options(base, false, &[MessageOptions::new(Amount(9000), true)]);
/// assert_eq!(out, MessageOptions::new(Amount(3000), true));
/// ```
pub fn override_options(
    base: MessageOptions,
    allow_relax: bool,
    overrides: &[MessageOptions],
) -> MessageOptions {
    let mut result = base;
    for o in overrides {
        result.anonymous = o.anonymous;
        if o.fee_limit.is_zero() {
            continue;
        }
        if o.fee_limit > base.fee_limit && !allow_relax {
            continue;
        }
        result.fee_limit = o.fee_limit;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(fee: i64, anonymous: bool) -> MessageOptions {
        MessageOptions::new(Amount(fee), anonymous)
    }

    #[test]
    fn test_lowering_without_relax() {
        let base = opts(3000, false);
        let out = override_options(base, false, &[opts(0, true), opts(2000, true)]);
        assert_eq!(out, opts(2000, true));
    }

    #[test]
    fn test_relaxing_needs_permission() {
        let base = opts(3000, false);
        let overrides = [opts(0, true), opts(2000, true), opts(50000, true)];
        assert_eq!(override_options(base, true, &overrides), opts(50000, true));
        assert_eq!(override_options(base, false, &overrides), opts(2000, true));
    }

    #[test]
    fn test_anonymous_from_last_override() {
        let base = opts(10, true);
        let out = override_options(base, false, &[opts(0, true), opts(0, false)]);
        assert!(!out.anonymous);
        assert_eq!(out.fee_limit, Amount(10));
    }

    #[test]
    fn test_no_overrides() {
        let base = opts(10, true);
        assert_eq!(override_options(base, true, &[]), base);
    }
}
