//! DAW collaboration: entities, locks, and the collaboration layer itself (C6).

pub mod collab;
pub mod entities;
pub mod lock;
