//! LwM2M notification attribute payloads.
//!
//! "Not set" is expressed with `Option`; the `0xFFFFFFFF` / quiet-NaN / `0xFF`
//! sentinels of the persistence formats exist only at the codec boundary.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Attributes attachable at the object, instance and default levels:
/// notification periods, evaluation periods, the confirmable-notification
/// flag and the `hqmax` extension.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CommonAttrs {
    pub min_period: Option<i32>,
    pub max_period: Option<i32>,
    pub min_eval_period: Option<i32>,
    pub max_eval_period: Option<i32>,
    pub hqmax: Option<i32>,
    pub confirmable: Option<bool>,
}

impl CommonAttrs {
    pub const EMPTY: CommonAttrs = CommonAttrs {
        min_period: None,
        max_period: None,
        min_eval_period: None,
        max_eval_period: None,
        hqmax: None,
        confirmable: None,
    };

    pub fn is_empty(&self) -> bool {
        self.min_period.is_none()
            && self.max_period.is_none()
            && self.min_eval_period.is_none()
            && self.max_eval_period.is_none()
            && self.hqmax.is_none()
            && self.confirmable.is_none()
    }
}

/// Attributes attachable at the resource and resource-instance levels:
/// everything from [`CommonAttrs`] plus the value-change thresholds and the
/// `edge` extension.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResourceAttrs {
    pub common: CommonAttrs,
    pub greater_than: Option<f64>,
    pub less_than: Option<f64>,
    pub step: Option<f64>,
    pub edge: Option<bool>,
}

impl ResourceAttrs {
    pub const EMPTY: ResourceAttrs = ResourceAttrs {
        common: CommonAttrs::EMPTY,
        greater_than: None,
        less_than: None,
        step: None,
        edge: None,
    };

    pub fn is_empty(&self) -> bool {
        self.common.is_empty()
            && self.greater_than.is_none()
            && self.less_than.is_none()
            && self.step.is_none()
            && self.edge.is_none()
    }
}
