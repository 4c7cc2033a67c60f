// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("database connection error"))]
    DatabaseConnectionError { source: mongodb::error::Error },

    #[snafu(display("database operation error"))]
    DatabaseError { source: mongodb::error::Error },

    #[snafu(display("failed to encode stored record"))]
    EncodeRecordError {
        source: mongodb::bson::ser::Error,
    },
}
