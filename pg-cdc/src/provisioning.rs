//! Idempotent creation of the publication and replication slot.
use tracing::info;

use crate::cdc_types::SlotConfig;
use crate::error::{CdcError, CdcResult};
use crate::source::Source;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub publication_created: bool,
    pub slot_created: bool,
}

pub struct SlotProvisioner;

impl SlotProvisioner {
    /// Makes sure the publication and the slot exist, creating what is missing.
    /// Safe to call on every run.
    pub async fn ensure(source: &dyn Source, slot: &SlotConfig) -> CdcResult<ProvisionOutcome> {
        let mut outcome = ProvisionOutcome::default();

        let publication = &slot.publication_name;
        if source
            .publication_exists(publication)
            .await
            .map_err(|e| provisioning_error(format!("publication {publication}"), e))?
        {
            info!("Using existing publication {}", publication);
        } else {
            info!(
                "Creating publication {} for tables {:?}",
                publication, slot.tables
            );
            source
                .create_publication(publication, &slot.tables)
                .await
                .map_err(|e| provisioning_error(format!("publication {publication}"), e))?;
            outcome.publication_created = true;
        }

        let slot_name = &slot.slot_name;
        if source
            .slot_exists(slot_name)
            .await
            .map_err(|e| provisioning_error(format!("replication slot {slot_name}"), e))?
        {
            info!("Using existing replication slot {}", slot_name);
        } else {
            info!(
                "Creating replication slot {} with plugin {}",
                slot_name, slot.plugin
            );
            source
                .create_slot(slot_name, slot.plugin)
                .await
                .map_err(|e| provisioning_error(format!("replication slot {slot_name}"), e))?;
            outcome.slot_created = true;
        }

        Ok(outcome)
    }
}

// Lost connections stay retryable, everything else becomes a provisioning failure.
fn provisioning_error(object: String, err: CdcError) -> CdcError {
    match err {
        err @ (CdcError::SourceConnection(_) | CdcError::Provisioning { .. }) => err,
        other => CdcError::Provisioning {
            object,
            reason: other.to_string(),
        },
    }
}
