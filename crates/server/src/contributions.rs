//! Contribution intake - contact upsert, recording, and the thank-you
//! message handed to the dispatch queue.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use donatrack_protocol::{Contact, NotificationRecord};

use crate::persistence;
use crate::queue::DispatchQueue;

/// Contributions at or below this amount (in rupees) get the short
/// acknowledgement; larger ones get the receipt follow-up wording.
const THRESHOLD_AMOUNT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct NewContribution {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: String,
    pub amount: i64,
    pub reference: Option<String>,
}

/// Record a contribution and queue its thank-you message. The caller gets
/// the pending notification back immediately; delivery is asynchronous.
pub async fn record_contribution(
    db_path: &Path,
    queue: &DispatchQueue,
    input: &NewContribution,
) -> anyhow::Result<(Contact, NotificationRecord)> {
    let contact = persistence::find_or_create_contact(
        db_path,
        &input.phone,
        input.name.as_deref(),
        input.email.as_deref(),
    )
    .await?;
    let contribution = persistence::insert_contribution(
        db_path,
        &contact.id,
        input.amount,
        input.reference.as_deref(),
    )
    .await?;

    let body = compose_thank_you(contact.name.as_deref(), input.amount);
    let record = queue.enqueue(&contact.id, &contact.phone, &body).await?;

    info!(
        component = "contributions",
        event = "contribution.recorded",
        contact_id = %contact.id,
        contribution_id = %contribution.id,
        amount = input.amount,
        record_id = %record.id,
    );
    Ok((contact, record))
}

/// Record a bank-transfer notice and queue the acknowledgement that the
/// transfer is awaiting verification.
pub async fn record_bank_transfer(
    db_path: &Path,
    queue: &DispatchQueue,
    input: &NewContribution,
) -> anyhow::Result<(Contact, NotificationRecord)> {
    let contact = persistence::find_or_create_contact(
        db_path,
        &input.phone,
        input.name.as_deref(),
        input.email.as_deref(),
    )
    .await?;
    let contribution = persistence::insert_contribution(
        db_path,
        &contact.id,
        input.amount,
        input.reference.as_deref(),
    )
    .await?;

    let body = compose_bank_transfer(
        contact.name.as_deref(),
        input.amount,
        input.reference.as_deref(),
    );
    let record = queue.enqueue(&contact.id, &contact.phone, &body).await?;

    info!(
        component = "contributions",
        event = "contribution.bank_transfer_recorded",
        contact_id = %contact.id,
        contribution_id = %contribution.id,
        amount = input.amount,
        record_id = %record.id,
    );
    Ok((contact, record))
}

fn compose_thank_you(name: Option<&str>, amount: i64) -> String {
    let who = name.unwrap_or("there");
    if amount <= THRESHOLD_AMOUNT {
        format!("Hi {who}, thank you for your contribution of ₹{amount}. Every bit counts!")
    } else {
        format!(
            "Hi {who}, thank you for your generous contribution of ₹{amount}! \
             Your receipt will follow shortly."
        )
    }
}

fn compose_bank_transfer(name: Option<&str>, amount: i64, reference: Option<&str>) -> String {
    let who = name.unwrap_or("there");
    match reference {
        Some(reference) => format!(
            "Hi {who}, we have noted your bank transfer of ₹{amount} (ref: {reference}). \
             We will confirm once it is verified."
        ),
        None => format!(
            "Hi {who}, we have noted your bank transfer of ₹{amount}. \
             We will confirm once it is verified."
        ),
    }
}
