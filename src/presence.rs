//! Presence: which participant is focused on which field.
//!
//! Presence is ephemeral — it carries no version, is never persisted,
//! and the newest update for a participant simply replaces the previous
//! one. The only structural guarantee is that the field-focus index shows
//! each participant under exactly one field at a time, and that a leaving
//! participant's entries are purged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Cursor types
// ───────────────────────────────────────────────────────────────────

/// A participant's last-known focus: a dotted field path plus a sender-
/// side timestamp used only to discard reordered updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub field_path: String,
    pub timestamp: u64,
}

impl CursorPosition {
    pub fn new(field_path: impl Into<String>, timestamp: u64) -> Self {
        Self {
            field_path: field_path.into(),
            timestamp,
        }
    }
}

/// RGBA color assigned to a participant for presence badges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a participant id.
    ///
    /// Uses HSL with high saturation; the hue is derived from the UUID
    /// hash so the same participant always renders the same color.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let saturation = 0.7;
        let lightness = 0.6;

        let (r, g, b) = hsl_to_rgb(hue, saturation, lightness);
        Self { r, g, b, a: 1.0 }
    }

    /// Create from RGBA components.
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Field-focus index
// ───────────────────────────────────────────────────────────────────

/// Tracks which field each participant is focused on.
///
/// Last-write-wins per participant: an update with an older timestamp
/// than the stored one is dropped (transports may reorder presence
/// relative to nothing — there is no cross-participant ordering).
#[derive(Debug, Default)]
pub struct PresenceIndex {
    by_participant: HashMap<Uuid, CursorPosition>,
}

impl PresenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a participant's cursor. `None` clears their focus.
    ///
    /// Returns true if the stored state changed.
    pub fn set(&mut self, participant_id: Uuid, cursor: Option<CursorPosition>) -> bool {
        match cursor {
            Some(next) => {
                if let Some(prev) = self.by_participant.get(&participant_id) {
                    if next.timestamp < prev.timestamp {
                        return false; // Reordered update — keep the newer one
                    }
                }
                self.by_participant.insert(participant_id, next);
                true
            }
            None => self.by_participant.remove(&participant_id).is_some(),
        }
    }

    /// Remove every presence entry for a participant (on leave).
    pub fn remove(&mut self, participant_id: &Uuid) {
        self.by_participant.remove(participant_id);
    }

    /// The field a participant is currently focused on.
    pub fn cursor_of(&self, participant_id: &Uuid) -> Option<&CursorPosition> {
        self.by_participant.get(participant_id)
    }

    /// All participants currently focused on the given field.
    pub fn participants_on(&self, field_path: &str) -> Vec<Uuid> {
        self.by_participant
            .iter()
            .filter(|(_, cursor)| cursor.field_path == field_path)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of participants with an active focus.
    pub fn len(&self) -> usize {
        self.by_participant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_participant.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_participant.clear();
    }
}
