//! Validation logic for FlinkApplication specs.

use crate::controller::error::{Error, Result};
use crate::crd::FlinkApplication;

/// Minimum job parallelism
pub const MIN_PARALLELISM: i32 = 1;

/// Minimum task slots per task manager
pub const MIN_TASK_SLOTS: i32 = 1;

/// Validate the application spec
pub fn validate_spec(app: &FlinkApplication) -> Result<()> {
    validate_required(app)?;
    validate_parallelism(app)?;
    validate_task_slots(app)?;
    Ok(())
}

fn validate_required(app: &FlinkApplication) -> Result<()> {
    if app.spec.image.trim().is_empty() {
        return Err(Error::Validation("image must not be empty".to_string()));
    }
    if app.spec.jar_name.trim().is_empty() {
        return Err(Error::Validation("jarName must not be empty".to_string()));
    }
    Ok(())
}

fn validate_parallelism(app: &FlinkApplication) -> Result<()> {
    let parallelism = app.spec.parallelism;
    if parallelism < MIN_PARALLELISM {
        return Err(Error::Validation(format!(
            "parallelism {} is below minimum {}",
            parallelism, MIN_PARALLELISM
        )));
    }
    Ok(())
}

fn validate_task_slots(app: &FlinkApplication) -> Result<()> {
    let slots = app.spec.task_slots();
    if slots < MIN_TASK_SLOTS {
        return Err(Error::Validation(format!(
            "taskSlots {} is below minimum {}",
            slots, MIN_TASK_SLOTS
        )));
    }
    Ok(())
}

/// Check if generation has changed (spec update)
pub fn generation_changed(app: &FlinkApplication) -> bool {
    let generation = app.metadata.generation;
    let observed = app.status.as_ref().and_then(|s| s.observed_generation);

    match (generation, observed) {
        (Some(current_gen), Some(obs)) => current_gen != obs,
        (Some(_), None) => true, // No observed generation, assume changed
        _ => false,
    }
}
