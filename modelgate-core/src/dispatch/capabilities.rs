//! Capability bitset.

use std::fmt;
use std::ops::BitOr;

use super::component::Component;

/// Set of verbs a component supports, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const LOAD: Self = Self(1 << 0);
    pub const PREDICT: Self = Self(1 << 1);
    pub const ROUTE: Self = Self(1 << 2);
    pub const TRANSFORM_INPUT: Self = Self(1 << 3);
    pub const TRANSFORM_OUTPUT: Self = Self(1 << 4);
    pub const AGGREGATE: Self = Self(1 << 5);
    pub const SCORE: Self = Self(1 << 6);
    pub const SEND_FEEDBACK: Self = Self(1 << 7);
    pub const METRICS: Self = Self(1 << 8);
    pub const TAGS: Self = Self(1 << 9);
    pub const INIT_METADATA: Self = Self(1 << 10);

    const NAMED: [(Self, &'static str); 11] = [
        (Self::LOAD, "load"),
        (Self::PREDICT, "predict"),
        (Self::ROUTE, "route"),
        (Self::TRANSFORM_INPUT, "transform_input"),
        (Self::TRANSFORM_OUTPUT, "transform_output"),
        (Self::AGGREGATE, "aggregate"),
        (Self::SCORE, "score"),
        (Self::SEND_FEEDBACK, "send_feedback"),
        (Self::METRICS, "metrics"),
        (Self::TAGS, "tags"),
        (Self::INIT_METADATA, "init_metadata"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Probes every `as_*` accessor once.
    pub fn discover(component: &dyn Component) -> Self {
        let probes = [
            (component.as_loader().is_some(), Self::LOAD),
            (component.as_predictor().is_some(), Self::PREDICT),
            (component.as_router().is_some(), Self::ROUTE),
            (component.as_input_transformer().is_some(), Self::TRANSFORM_INPUT),
            (component.as_output_transformer().is_some(), Self::TRANSFORM_OUTPUT),
            (component.as_combiner().is_some(), Self::AGGREGATE),
            (component.as_scorer().is_some(), Self::SCORE),
            (component.as_feedback_handler().is_some(), Self::SEND_FEEDBACK),
            (component.as_metrics_source().is_some(), Self::METRICS),
            (component.as_tags_source().is_some(), Self::TAGS),
            (component.as_metadata_source().is_some(), Self::INIT_METADATA),
        ];
        probes
            .into_iter()
            .filter(|(present, _)| *present)
            .fold(Self::empty(), |acc, (_, cap)| acc | cap)
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join("|"))
    }
}
