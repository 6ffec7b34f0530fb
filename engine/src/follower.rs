use std::fmt;

use broker::types::Credentials;

/// A follower account subscribed to master replication.
///
/// The password arrives already decrypted and lives only in memory; `Debug`
/// redacts it.
#[derive(Clone)]
pub struct Follower {
    pub id: u64,
    pub user_id: u64,
    pub login: u64,
    pub server: String,
    pub password: String,
    /// Lot scaling applied to every copied volume; 0 disables sizing and is
    /// treated as 1.0.
    pub lot_multiplier: f64,
    /// Hard cap on copied lot size; 0 = uncapped.
    pub max_lot: f64,
    pub copy_enabled: bool,
}

impl Follower {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            login: self.login,
            password: self.password.clone(),
            server: self.server.clone(),
        }
    }

    /// Multiplier with the 0-means-disabled rule applied.
    pub fn effective_multiplier(&self) -> f64 {
        if self.lot_multiplier > 0.0 {
            self.lot_multiplier
        } else {
            1.0
        }
    }
}

impl fmt::Debug for Follower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Follower")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("login", &self.login)
            .field("server", &self.server)
            .field("password", &"<redacted>")
            .field("lot_multiplier", &self.lot_multiplier)
            .field("max_lot", &self.max_lot)
            .field("copy_enabled", &self.copy_enabled)
            .finish()
    }
}
