//! Component lifecycle state machine
//!
//! The transition table is a pair of pure functions ([`ComponentState::admit`]
//! and [`ComponentState::on_exit`]); [`ComponentGate`] applies them under a
//! per-component monitor and blocks flushes until writers drain.

use parking_lot::{Condvar, Mutex};
use strata_common::{ComponentId, Error, OpType, Result};

/// Lifecycle state of one component
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentState {
    /// Mutable and readable; the only state admitting plain modifications
    ReadableWritable,
    /// Full (memory) or immutable (disk)
    ReadableUnwritable,
    /// A flush is draining writers or writing the disk component
    ReadableUnwritableFlushing,
    /// Disk component being merged into a newer one
    ReadableMerging,
    /// Retired; waiting for its last readers before reset or destruction
    UnreadableUnwritable,
}

impl ComponentState {
    pub const ALL: [Self; 5] = [
        Self::ReadableWritable,
        Self::ReadableUnwritable,
        Self::ReadableUnwritableFlushing,
        Self::ReadableMerging,
        Self::UnreadableUnwritable,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReadableWritable => "readable-writable",
            Self::ReadableUnwritable => "readable-unwritable",
            Self::ReadableUnwritableFlushing => "readable-unwritable-flushing",
            Self::ReadableMerging => "readable-merging",
            Self::UnreadableUnwritable => "unreadable-unwritable",
        }
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Self::UnreadableUnwritable)
    }

    /// State after admitting `op`, or `None` if the state rejects it
    #[must_use]
    pub const fn admit(self, op: OpType) -> Option<Self> {
        match (op, self) {
            (OpType::Modification, Self::ReadableWritable)
            | (OpType::ForceModification, Self::ReadableWritable | Self::ReadableUnwritable) => {
                Some(self)
            }
            (OpType::Search, state) if state.is_readable() => Some(state),
            (OpType::Flush, Self::ReadableWritable | Self::ReadableUnwritable) => {
                Some(Self::ReadableUnwritableFlushing)
            }
            (OpType::Merge, Self::ReadableUnwritable) => Some(Self::ReadableMerging),
            _ => None,
        }
    }

    /// State after `op` leaves. `retire` in the result asks the caller to
    /// reset (memory) or destroy (disk) the component's storage.
    #[must_use]
    pub const fn on_exit(self, op: OpType, exit: ExitContext) -> Transition {
        let keep = Transition {
            state: self,
            retire: false,
        };
        match op {
            OpType::Modification | OpType::ForceModification => {
                if exit.full && matches!(self, Self::ReadableWritable) {
                    Transition {
                        state: Self::ReadableUnwritable,
                        retire: false,
                    }
                } else {
                    keep
                }
            }
            OpType::Search => {
                if matches!(self, Self::UnreadableUnwritable) && exit.readers_left == 0 {
                    Transition::retired(exit.recyclable)
                } else {
                    keep
                }
            }
            OpType::Flush => {
                if !exit.success {
                    Transition {
                        state: if exit.full {
                            Self::ReadableUnwritable
                        } else {
                            Self::ReadableWritable
                        },
                        retire: false,
                    }
                } else if exit.readers_left == 0 {
                    Transition::retired(exit.recyclable)
                } else {
                    Transition {
                        state: Self::UnreadableUnwritable,
                        retire: false,
                    }
                }
            }
            OpType::Merge => {
                if !exit.success {
                    Transition {
                        state: Self::ReadableUnwritable,
                        retire: false,
                    }
                } else if exit.readers_left == 0 {
                    Transition::retired(false)
                } else {
                    Transition {
                        state: Self::UnreadableUnwritable,
                        retire: false,
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Facts an exiting operation reports to the state machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitContext {
    /// The operation succeeded
    pub success: bool,
    /// The component's flush policy reports it full
    pub full: bool,
    /// Readers still inside after this exit
    pub readers_left: usize,
    /// Retired storage is reset for reuse rather than destroyed
    pub recyclable: bool,
}

/// Result of an exit transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub state: ComponentState,
    pub retire: bool,
}

impl Transition {
    const fn retired(recyclable: bool) -> Self {
        Self {
            state: if recyclable {
                ComponentState::ReadableWritable
            } else {
                ComponentState::UnreadableUnwritable
            },
            retire: true,
        }
    }
}

#[derive(Debug)]
struct GateState {
    state: ComponentState,
    readers: usize,
    writers: usize,
    /// Bumped every time retired storage is reset for reuse
    incarnation: u64,
}

/// Per-component monitor applying the state machine
#[derive(Debug)]
pub struct ComponentGate {
    inner: Mutex<GateState>,
    writers_drained: Condvar,
}

impl ComponentGate {
    #[must_use]
    pub const fn new(state: ComponentState) -> Self {
        Self {
            inner: Mutex::new(GateState {
                state,
                readers: 0,
                writers: 0,
                incarnation: 0,
            }),
            writers_drained: Condvar::new(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.inner.lock().state
    }

    pub fn incarnation(&self) -> u64 {
        self.inner.lock().incarnation
    }

    /// (readers, writers) currently inside
    pub fn occupancy(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.readers, inner.writers)
    }

    /// Admit `op`. A flush blocks until in-flight writers have left. When
    /// `incarnation` is given, a component recycled since it was observed
    /// is rejected as well.
    pub fn enter(&self, component: ComponentId, op: OpType, incarnation: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock();
        let next = match inner.state.admit(op) {
            Some(next) if incarnation.is_none_or(|seen| seen == inner.incarnation) => next,
            _ => {
                return Err(Error::ComponentUnavailable {
                    component,
                    op,
                    state: inner.state.name(),
                });
            }
        };
        inner.state = next;
        if op.is_writer() {
            inner.writers += 1;
            return Ok(());
        }
        if op == OpType::Flush {
            while inner.writers > 0 {
                self.writers_drained.wait(&mut inner);
            }
        }
        inner.readers += 1;
        Ok(())
    }

    /// Leave after `op`. `retire` runs inside the monitor when the state
    /// machine asks for it; if it fails the component stays retired.
    pub fn exit(
        &self,
        op: OpType,
        success: bool,
        full: bool,
        recyclable: bool,
        retire: impl FnOnce() -> Result<()>,
    ) -> Result<ComponentState> {
        let mut inner = self.inner.lock();
        if op.is_writer() {
            inner.writers = inner.writers.saturating_sub(1);
            if inner.writers == 0 {
                self.writers_drained.notify_all();
            }
        } else {
            inner.readers = inner.readers.saturating_sub(1);
        }
        let transition = inner.state.on_exit(
            op,
            ExitContext {
                success,
                full,
                readers_left: inner.readers,
                recyclable,
            },
        );
        if transition.retire {
            if let Err(e) = retire() {
                inner.state = ComponentState::UnreadableUnwritable;
                return Err(e);
            }
            if recyclable {
                inner.incarnation += 1;
            }
        }
        inner.state = transition.state;
        Ok(inner.state)
    }
}
