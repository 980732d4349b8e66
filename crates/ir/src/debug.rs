//! Debug locations.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::module::Module;
use crate::value::{InstId, Value};

/// A source location token carried by instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugLoc {
    pub line: u32,
    pub col: u32,
}

/// Bound on the breadth-first walk of [`find_nearest_debug_loc`].
const NEAREST_LOC_BUDGET: usize = 64;

/// Finds a debug location near `inst` when it carries none itself.
///
/// Walks backward through the containing block, then breadth-first through
/// predecessor blocks and operand definitions, visiting at most a bounded
/// number of instructions. Returns `None` when nothing in range has a
/// location; callers then fall back to the function's last terminator.
pub fn find_nearest_debug_loc(m: &Module, inst: InstId) -> Option<DebugLoc> {
    if let Some(loc) = m.inst(inst).dbg {
        return Some(loc);
    }
    let mut seen: HashSet<InstId> = HashSet::new();
    let mut queue: VecDeque<InstId> = VecDeque::new();
    queue.push_back(inst);
    let mut budget = NEAREST_LOC_BUDGET;

    while let Some(cur) = queue.pop_front() {
        if !seen.insert(cur) {
            continue;
        }
        if budget == 0 {
            break;
        }
        budget -= 1;

        if let Some(loc) = m.inst(cur).dbg {
            return Some(loc);
        }

        let block = m.inst(cur).parent;
        let insts = m.block(block).insts.clone();
        if let Some(pos) = insts.iter().position(|i| *i == cur) {
            if pos > 0 {
                queue.push_back(insts[pos - 1]);
            } else {
                for pred in m.preds(block) {
                    if let Some(term) = m.terminator(pred) {
                        queue.push_back(term);
                    }
                }
            }
        }
        for op in m.inst(cur).operands.clone() {
            if let Value::Inst(def) = op {
                queue.push_back(def);
            }
        }
    }
    None
}
