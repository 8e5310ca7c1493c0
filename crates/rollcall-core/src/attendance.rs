//! Attendance roll-up: recognition decisions folded into a per-roster sheet.

use crate::matcher::Roster;
use crate::types::{FaceDecision, IdentityId};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub status: AttendanceStatus,
    /// Closest accepted distance seen for this identity, if any.
    pub best_distance: Option<f32>,
    /// Set once someone flips the status by hand.
    pub overridden: bool,
}

/// Present/absent for every identity on the roster.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttendanceSheet {
    entries: BTreeMap<IdentityId, AttendanceEntry>,
    /// Faces that matched nobody on the roster.
    pub unknown_faces: usize,
}

impl AttendanceSheet {
    /// An identity is present if at least one accepted decision names it.
    pub fn from_decisions(roster: &Roster, decisions: &[FaceDecision]) -> Self {
        let mut entries: BTreeMap<IdentityId, AttendanceEntry> = roster
            .ids()
            .map(|id| {
                (
                    id.clone(),
                    AttendanceEntry {
                        status: AttendanceStatus::Absent,
                        best_distance: None,
                        overridden: false,
                    },
                )
            })
            .collect();

        let mut unknown_faces = 0;
        for face in decisions {
            let matched = face
                .decision
                .identity_id
                .as_ref()
                .filter(|_| face.decision.accepted);
            let Some(entry) = matched.and_then(|id| entries.get_mut(id)) else {
                unknown_faces += 1;
                continue;
            };
            entry.status = AttendanceStatus::Present;
            let distance = face.decision.distance;
            entry.best_distance = Some(entry.best_distance.map_or(distance, |d| d.min(distance)));
        }

        Self {
            entries,
            unknown_faces,
        }
    }

    pub fn status(&self, id: &IdentityId) -> Option<AttendanceStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    /// Flip an identity's status by hand. Returns the new status.
    pub fn toggle(&mut self, id: &IdentityId) -> Option<AttendanceStatus> {
        let entry = self.entries.get_mut(id)?;
        entry.status = match entry.status {
            AttendanceStatus::Present => AttendanceStatus::Absent,
            AttendanceStatus::Absent => AttendanceStatus::Present,
        };
        entry.overridden = true;
        Some(entry.status)
    }

    pub fn present_count(&self) -> usize {
        self.count(AttendanceStatus::Present)
    }

    pub fn absent_count(&self) -> usize {
        self.count(AttendanceStatus::Absent)
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityId, &AttendanceEntry)> {
        self.entries.iter()
    }

    fn count(&self, status: AttendanceStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }
}
