pub mod observation;

pub use observation::{
    HealthReport, ListOrder, NaturalKey, NewObservation, Observation, ObservationStatus,
    SaveOutcome, NOT_APPLICABLE,
};
