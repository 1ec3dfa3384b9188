//! The trail field: a double-buffered 2D grid of non-negative scalars.
//!
//! Exactly two generations live in a [`FieldRing`]. At any instant one is
//! *current* (readable) and the other is *next* (the write target of the
//! field pass). Only the engine flips them, through [`FieldRing::swap`], and
//! every pass receives its read/write buffers as an explicit [`FieldRoles`]
//! designation instead of working out which slot is live.
//!
//! # Field pass
//!
//! ```text
//! aggregate = (1 - diffusion) * v + diffusion * mean3x3(v)   // toroidal
//! next      = max(0, decay * aggregate)
//! ```
//!
//! Deposits made by agents during a frame are already part of `v` when the
//! next frame's field pass reads it.

use crate::params::SimParams;

/// One of the two field generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// Read/write designation handed to a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldRoles {
    pub read: Slot,
    pub write: Slot,
}

/// Two field generations plus the "current" marker.
#[derive(Debug)]
pub struct FieldRing<T> {
    slots: [T; 2],
    current: Slot,
}

impl<T> FieldRing<T> {
    /// Build a ring whose current generation is `current`.
    pub fn new(a: T, b: T, current: Slot) -> Self {
        Self {
            slots: [a, b],
            current,
        }
    }

    pub fn current_slot(&self) -> Slot {
        self.current
    }

    pub fn current(&self) -> &T {
        &self.slots[self.current.index()]
    }

    pub fn next(&self) -> &T {
        &self.slots[self.current.other().index()]
    }

    pub fn get(&self, slot: Slot) -> &T {
        &self.slots[slot.index()]
    }

    /// Roles for the field pass: read current, write next.
    pub fn advance_roles(&self) -> FieldRoles {
        FieldRoles {
            read: self.current,
            write: self.current.other(),
        }
    }

    /// Make the freshly written generation current.
    pub fn swap(&mut self) {
        self.current = self.current.other();
    }

    pub fn into_slots(self) -> [T; 2] {
        self.slots
    }
}

/// New value of cell `index`, reading the current generation through `read`.
pub fn update_cell(index: usize, params: &SimParams, read: impl Fn(usize) -> f32) -> f32 {
    let w = params.width as usize;
    let h = params.height as usize;
    let x = index % w;
    let y = index / w;

    let v = read(index);
    let aggregate = if params.diffusion > 0.0 {
        let mut sum = 0.0;
        for dy in [h - 1, 0, 1] {
            let row = (y + dy) % h * w;
            for dx in [w - 1, 0, 1] {
                sum += read(row + (x + dx) % w);
            }
        }
        (1.0 - params.diffusion) * v + params.diffusion * (sum / 9.0)
    } else {
        v
    };

    (params.decay * aggregate).max(0.0)
}
