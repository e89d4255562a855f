/// Used to represent stack operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackEffect {
    pub pushes: u32,
    pub pops: u32,
}

/// Why a stack effect cannot be applied to a depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthError {
    Underflow,
    Overflow,
}

/// One row of a code object's exception table.
/// Offsets are in code units (not bytes), `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    /// Stack depth at the start of the try block
    pub depth: u32,
    /// Whether to push the index of the last executed instruction
    pub lasti: bool,
}

impl ExceptionTableEntry {
    /// Stack depth when the handler is entered: the saved depth, the exception and optionally `lasti`.
    /// Saturates for depths no real code object has.
    pub fn handler_depth(&self) -> u32 {
        self.depth.saturating_add(1 + u32::from(self.lasti))
    }
}

impl StackEffect {
    pub const fn new(pops: u32, pushes: u32) -> Self {
        StackEffect { pushes, pops }
    }

    /// Creates a StackEffect with equal pushes and pops.
    pub const fn balanced(count: u32) -> Self {
        StackEffect {
            pushes: count,
            pops: count,
        }
    }

    /// Creates a StackEffect when only pushing
    pub const fn push(count: u32) -> Self {
        StackEffect {
            pushes: count,
            pops: 0,
        }
    }

    /// Creates a StackEffect when only popping
    pub const fn pop(count: u32) -> Self {
        StackEffect {
            pushes: 0,
            pops: count,
        }
    }

    /// For when there is no stack access
    pub const fn zero() -> Self {
        StackEffect { pushes: 0, pops: 0 }
    }

    /// Calculates the net total for the stackeffect
    pub fn net_total(&self) -> i64 {
        i64::from(self.pushes) - i64::from(self.pops)
    }

    /// Depth after applying this effect to `depth`
    pub fn apply(&self, depth: u32) -> Result<u32, DepthError> {
        depth
            .checked_sub(self.pops)
            .ok_or(DepthError::Underflow)?
            .checked_add(self.pushes)
            .ok_or(DepthError::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_effects() {
        assert_eq!(StackEffect::new(2, 1).apply(2), Ok(1));
        assert_eq!(StackEffect::new(2, 1).apply(1), Err(DepthError::Underflow));
        assert_eq!(
            StackEffect::push(2).apply(u32::MAX - 1),
            Err(DepthError::Overflow)
        );
        assert_eq!(StackEffect::new(1, u32::MAX).apply(1), Ok(u32::MAX));
        assert_eq!(StackEffect::push(3).net_total(), 3);
        assert_eq!(StackEffect::balanced(4).net_total(), 0);
    }

    #[test]
    fn handler_depth_counts_exception_and_lasti() {
        let entry = ExceptionTableEntry {
            start: 0,
            end: 4,
            target: 8,
            depth: 2,
            lasti: true,
        };

        assert_eq!(entry.handler_depth(), 4);
        assert_eq!(
            ExceptionTableEntry {
                lasti: false,
                ..entry
            }
            .handler_depth(),
            3
        );
    }
}
