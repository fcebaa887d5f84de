//! Instrumentation rules.

use weft_isa::DecodedInst;
use weft_range::RangeSet;

use crate::cond::PatchCondition;
use crate::gen::{GenError, InstPosition, PatchGenerator};
use crate::patch::Patch;

/// A user-visible instrumentation rule: a condition, the generators to
/// splice when it matches, the position relative to the original
/// instruction, and whether control must return to the host so a
/// callback's `VmAction` can take effect.
#[derive(Clone, Debug)]
pub struct InstrRule {
    pub condition: PatchCondition,
    pub position: InstPosition,
    pub break_to_host: bool,
    pub generators: Vec<PatchGenerator>,
    /// Address filter; empty means everywhere.
    pub range: RangeSet<u64>,
}

impl InstrRule {
    /// The standard callback rule: mark the event and break to the host
    /// at `position` when `condition` matches.
    pub fn callback_rule(condition: PatchCondition, position: InstPosition) -> Self {
        Self {
            condition,
            position,
            break_to_host: true,
            generators: Vec::new(),
            range: RangeSet::new(),
        }
    }

    /// A raw generator rule with no host break.
    pub fn generator_rule(
        condition: PatchCondition,
        position: InstPosition,
        generators: Vec<PatchGenerator>,
    ) -> Self {
        Self {
            condition,
            position,
            break_to_host: false,
            generators,
            range: RangeSet::new(),
        }
    }

    pub fn with_range(mut self, range: RangeSet<u64>) -> Self {
        self.range = range;
        self
    }

    pub fn matches(&self, inst: &DecodedInst) -> bool {
        (self.range.is_empty() || self.range.contains(inst.address)) && self.condition.matches(inst)
    }

    /// Apply the rule to a matching patch. Returns whether it applied.
    pub fn instrument(&self, patch: &mut Patch) -> Result<bool, GenError> {
        if !self.matches(&patch.inst) {
            return Ok(false);
        }
        if self.break_to_host {
            patch.add_event_break(self.position)?;
        }
        if !self.generators.is_empty() {
            patch.add_generators(self.position, &self.generators)?;
        }
        Ok(true)
    }
}
