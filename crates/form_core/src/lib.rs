//! Form screen state: a field list fetched once, per-field text edits,
//! and a validity flag recomputed synchronously on every change.
//!
//! The controller is owned by a single interaction context (`&mut
//! self` mutation, no locks on the text map); the published state goes
//! out through watch channels so late UI subscribers still see the
//! current field list and validity.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use flow::{Flow, FlowEvent};
use shared::{
    domain::FormField,
    error::UnknownFieldError,
};
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// External collaborator producing the field list: a one-shot flow
/// emitting exactly one value then completing. A failure terminal is
/// allowed and surfaced by [`FormController::load`].
pub trait FetchFieldsService: Send + Sync {
    fn fetch_fields(&self) -> Flow<Vec<FormField>>;
}

/// Canned field list, the stand-in for a real fetch.
pub struct StaticFieldsService {
    fields: Vec<FormField>,
}

impl StaticFieldsService {
    pub fn new(fields: Vec<FormField>) -> Self {
        Self { fields }
    }
}

impl FetchFieldsService for StaticFieldsService {
    fn fetch_fields(&self) -> Flow<Vec<FormField>> {
        Flow::just(self.fields.clone())
    }
}

/// Reactive view-model state for one form screen.
pub struct FormController {
    service: Box<dyn FetchFieldsService>,
    fields: watch::Sender<Vec<FormField>>,
    validity: watch::Sender<bool>,
    field_texts: HashMap<FormField, String>,
    rejected_edits: broadcast::Sender<UnknownFieldError>,
}

impl FormController {
    pub fn new(service: impl FetchFieldsService + 'static) -> Self {
        let (fields, _) = watch::channel(Vec::new());
        let (validity, _) = watch::channel(false);
        let (rejected_edits, _) = broadcast::channel(64);
        Self {
            service: Box::new(service),
            fields,
            validity,
            field_texts: HashMap::new(),
            rejected_edits,
        }
    }

    /// Fetches the field list once, initializes every field's text to
    /// empty, and publishes the new list plus the recomputed validity.
    pub async fn load(&mut self) -> Result<()> {
        let mut fetch = self.service.fetch_fields().subscribe();
        match fetch.recv().await {
            Some(FlowEvent::Value(fields)) => {
                self.field_texts = fields
                    .iter()
                    .map(|field| (field.clone(), String::new()))
                    .collect();
                self.fields.send_replace(fields);
                self.publish_validity();
                Ok(())
            }
            Some(FlowEvent::Failed(error)) => Err(error),
            Some(FlowEvent::Completed) | None => {
                Err(anyhow!("fetch fields flow ended without a value"))
            }
        }
    }

    /// Stores an edit and synchronously recomputes validity. An edit
    /// for an unknown field leaves all state untouched; it is logged
    /// and reported on the rejected-edits channel instead of being
    /// silently dropped.
    pub fn update_field_text(&mut self, field: &FormField, text: impl Into<String>) {
        if !self.field_texts.contains_key(field) {
            let rejected = UnknownFieldError::new(field.id);
            warn!(field_id = %field.id, "edit for unknown form field ignored");
            let _ = self.rejected_edits.send(rejected);
            return;
        }
        self.field_texts.insert(field.clone(), text.into());
        self.publish_validity();
    }

    /// Valid iff every known field's stored text is non-empty.
    pub fn is_form_valid(&self) -> bool {
        *self.validity.borrow()
    }

    /// Published field list; replays the current value to new
    /// subscribers.
    pub fn fields(&self) -> watch::Receiver<Vec<FormField>> {
        self.fields.subscribe()
    }

    /// Published validity flag; replays the current value to new
    /// subscribers.
    pub fn validity(&self) -> watch::Receiver<bool> {
        self.validity.subscribe()
    }

    /// Edits addressed to unknown fields, for embedders that want to
    /// observe rather than ignore them.
    pub fn rejected_edits(&self) -> broadcast::Receiver<UnknownFieldError> {
        self.rejected_edits.subscribe()
    }

    fn publish_validity(&self) {
        let valid = !self.field_texts.is_empty()
            && self.field_texts.values().all(|text| !text.is_empty());
        self.validity.send_replace(valid);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
