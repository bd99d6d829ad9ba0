use crate::import::ImportSummary;
use crate::store::models::EntityId;

/// Typed notifications broadcast by the profile. Delivery is fire-and-forget:
/// a subscriber that falls behind loses the oldest messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileEvent {
    /// A mutation committed.
    DidUpdate,
    WillReset,
    DidReset,
    /// Fraction of the running import applied so far, 0.0 to 1.0.
    ImportProgress(f64),
    ImportFinished(ImportSummary),
    WillMigrate { from: u32, to: u32 },
    /// Started the step that produces version `step`.
    MigrateStep { from: u32, step: u32 },
    DidMigrate { from: u32, to: u32 },
    MigrateFailed { from: u32, to: u32, error: String },
    WillEditObject(EntityId),
    DidEditObject(EntityId),
    FailedEditObject { entity: EntityId, error: String },
}
