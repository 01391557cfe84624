use std::sync::Arc;

use crate::{
    auth::IdentityVerifier, bans::BanList, config::Config, sentinel::Sentinel,
    upstream::UpstreamClient,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: IdentityVerifier,
    pub sentinel: Arc<Sentinel>,
    pub bans: BanList,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(
        config: Config,
        identity: IdentityVerifier,
        sentinel: Arc<Sentinel>,
        bans: BanList,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            config: Arc::new(config),
            identity,
            sentinel,
            bans,
            upstream,
        }
    }

    /// In-memory flags, log-only alerts, no bans, and an upstream nobody listens on.
    #[cfg(test)]
    pub fn for_tests(config: Config) -> Self {
        use crate::{alerts::AlertDispatcher, flags::FlagStore};

        let identity =
            IdentityVerifier::new(config.jwt_secret.as_deref(), config.jwt_issuer.as_deref());
        let sentinel = Arc::new(Sentinel::new(
            &config.detection,
            FlagStore::in_memory(),
            Arc::new(AlertDispatcher::new(None)),
        ));
        let upstream =
            UpstreamClient::new(config.upstream_url.clone()).expect("upstream client builds");
        Self::new(config, identity, sentinel, BanList::default(), upstream)
    }
}
