// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use backoff::future::retry;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_document};
use mongodb::options::{FindOneOptions, UpdateOptions};
use mongodb::{Client, Collection, Database};
use relay_events::Fingerprint;
use snafu::ResultExt;

use super::config::RepositoryConfig;
use super::error::{
    DatabaseConnectionSnafu, DatabaseSnafu, EncodeRecordSnafu, Error,
};
use super::types::{
    HardwareVerificationFailure, KnownDevice, RelayRecord, TaskServiceState,
    VerificationData, VerifiedHardware,
};

const RELAY_RECORDS: &str = "relay_records";
const VERIFIED_HARDWARE: &str = "verified_hardware";
const VERIFICATION_FAILURES: &str = "hardware_verification_failures";
const VERIFICATION_DATA: &str = "verification_data";
const TASK_STATE: &str = "task_state";
const KNOWN_DEVICES: &str = "known_devices";

#[derive(Clone)]
pub struct Repository {
    db: Database,
}

impl Repository {
    /// Connects to the document store, waiting for the server with the
    /// configured backoff strategy.
    pub async fn new(config: RepositoryConfig) -> Result<Self, Error> {
        let db = retry(config.backoff.clone(), || async {
            tracing::info!(?config, "trying to connect to the document store");
            let client = Client::with_uri_str(config.uri.inner()).await?;
            let db = client.database(&config.database);
            db.run_command(doc! {"ping": 1}, None).await?;
            Ok(db)
        })
        .await
        .context(DatabaseConnectionSnafu)?;
        Ok(Self { db })
    }

    /// Upserts every record, keyed by fingerprint.
    pub async fn upsert_relay_records(
        &self,
        records: &[RelayRecord],
    ) -> Result<(), Error> {
        let collection = self.relay_records();
        let options = UpdateOptions::builder().upsert(true).build();
        for record in records {
            let update =
                doc! {"$set": to_document(record).context(EncodeRecordSnafu)?};
            collection
                .update_one(
                    doc! {"fingerprint": record.fingerprint.to_string()},
                    update,
                    options.clone(),
                )
                .await
                .context(DatabaseSnafu)?;
        }
        Ok(())
    }

    /// One page of records; callers chunk the fingerprint list themselves.
    pub async fn relay_records_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<RelayRecord>, Error> {
        let keys: Vec<String> =
            fingerprints.iter().map(|f| f.to_string()).collect();
        let cursor = self
            .relay_records()
            .find(doc! {"fingerprint": {"$in": keys}}, None)
            .await
            .context(DatabaseSnafu)?;
        cursor.try_collect().await.context(DatabaseSnafu)
    }

    /// Drops the transient relay records of a finished run.
    pub async fn delete_all_relay_records(&self) -> Result<u64, Error> {
        let result = self
            .relay_records()
            .delete_many(doc! {}, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(result.deleted_count)
    }

    pub async fn verified_hardware_exists_by_device_serial(
        &self,
        device_serial: &str,
    ) -> Result<bool, Error> {
        let found = self
            .verified_hardware()
            .find_one(doc! {"device_serial": device_serial}, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(found.is_some())
    }

    pub async fn verified_hardware_by_atec_serial(
        &self,
        atec_serial: &str,
    ) -> Result<Vec<VerifiedHardware>, Error> {
        let cursor = self
            .verified_hardware()
            .find(doc! {"atec_serial": atec_serial}, None)
            .await
            .context(DatabaseSnafu)?;
        cursor.try_collect().await.context(DatabaseSnafu)
    }

    pub async fn insert_verified_hardware(
        &self,
        record: &VerifiedHardware,
    ) -> Result<(), Error> {
        self.verified_hardware()
            .insert_one(record, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }

    pub async fn insert_hardware_verification_failure(
        &self,
        record: &HardwareVerificationFailure,
    ) -> Result<(), Error> {
        self.verification_failures()
            .insert_one(record, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }

    pub async fn insert_verification_data(
        &self,
        data: &VerificationData,
    ) -> Result<(), Error> {
        self.verification_data()
            .insert_one(data, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }

    pub async fn latest_verification_data(
        &self,
    ) -> Result<Option<VerificationData>, Error> {
        let options = FindOneOptions::builder()
            .sort(doc! {"verified_at": -1})
            .build();
        self.verification_data()
            .find_one(doc! {}, options)
            .await
            .context(DatabaseSnafu)
    }

    pub async fn known_device_exists(
        &self,
        unique_id: &str,
    ) -> Result<bool, Error> {
        let found = self
            .known_devices()
            .find_one(doc! {"unique_id": unique_id}, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(found.is_some())
    }

    pub async fn insert_known_device(
        &self,
        device: &KnownDevice,
    ) -> Result<(), Error> {
        self.known_devices()
            .insert_one(device, None)
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }

    /// Loads the task state, creating the singleton document on first use.
    pub async fn load_task_state(&self) -> Result<TaskServiceState, Error> {
        let found = self
            .task_states()
            .find_one(doc! {}, None)
            .await
            .context(DatabaseSnafu)?;
        match found {
            Some(state) => Ok(state),
            None => {
                let state = TaskServiceState::default();
                self.task_states()
                    .insert_one(&state, None)
                    .await
                    .context(DatabaseSnafu)?;
                Ok(state)
            }
        }
    }

    pub async fn set_validating(
        &self,
        is_validating: bool,
    ) -> Result<(), Error> {
        let options = UpdateOptions::builder().upsert(true).build();
        self.task_states()
            .update_one(
                doc! {},
                doc! {"$set": {"is_validating": is_validating}},
                options,
            )
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }

    fn relay_records(&self) -> Collection<RelayRecord> {
        self.db.collection(RELAY_RECORDS)
    }

    fn verified_hardware(&self) -> Collection<VerifiedHardware> {
        self.db.collection(VERIFIED_HARDWARE)
    }

    fn verification_failures(&self) -> Collection<HardwareVerificationFailure> {
        self.db.collection(VERIFICATION_FAILURES)
    }

    fn verification_data(&self) -> Collection<VerificationData> {
        self.db.collection(VERIFICATION_DATA)
    }

    fn task_states(&self) -> Collection<TaskServiceState> {
        self.db.collection(TASK_STATE)
    }

    fn known_devices(&self) -> Collection<KnownDevice> {
        self.db.collection(KNOWN_DEVICES)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("database", &self.db.name())
            .finish()
    }
}
