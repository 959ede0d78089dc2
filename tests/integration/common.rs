//! Shared harness for the integration suite.

use corekeep::config::SupervisorConfig;
use corekeep::orchestrator::{Components, Orchestrator};
use corekeep::store::{StateStore, VersionStore};
use corekeep::test_utils::{
    FakeHealth, FakeProcess, ReleaseFixture, StaticReleases, TestRoot, init_test_logging,
    native_binary,
};
use corekeep::upgrade::UpgradeCoordinator;
use corekeep::utils::{Arch, HostPlatform, OsToken};
use std::sync::Arc;

/// Host used by every harness, independent of the machine running the tests.
pub fn linux_host() -> HostPlatform {
    HostPlatform {
        os: OsToken::Linux,
        arch: Arch::Amd64,
        emulation: None,
    }
}

/// An orchestrator over a temporary root with every seam faked.
pub struct Supervisor {
    pub root: TestRoot,
    pub releases: Arc<StaticReleases>,
    /// Main instance
    pub process: Arc<FakeProcess>,
    /// Dry-run instance
    pub dry_run: Arc<FakeProcess>,
    pub health: Arc<FakeHealth>,
    pub state: Arc<StateStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut SupervisorConfig)) -> Self {
        init_test_logging(None);
        let mut root = TestRoot::new();
        adjust(&mut root.config);
        let config = root.config.clone();

        let releases = Arc::new(StaticReleases::default());
        let process = Arc::new(FakeProcess::new());
        let dry_run = Arc::new(FakeProcess::new());
        let health = Arc::new(FakeHealth::healthy());
        let state = Arc::new(StateStore::load(config.layout().state_file()).unwrap());
        let coordinator = Arc::new(
            UpgradeCoordinator::new(
                config.clone(),
                linux_host(),
                releases.clone(),
                state.clone(),
                dry_run.clone(),
                health.clone(),
            )
            .unwrap(),
        );
        let orchestrator = Orchestrator::new(
            config,
            Components {
                process: process.clone(),
                health: health.clone(),
                state: state.clone(),
                coordinator,
            },
        );

        Self {
            root,
            releases,
            process,
            dry_run,
            health,
            state,
            orchestrator,
        }
    }

    pub fn store(&self) -> &VersionStore {
        self.orchestrator.store()
    }

    /// Publish `tag` with a valid archive for the test host.
    pub fn publish(&self, tag: &str) -> ReleaseFixture {
        let fixture = self.fixture(tag, &native_binary(&linux_host()));
        self.releases.push(fixture.release.clone());
        fixture
    }

    /// Build `tag` packaging `binary` without publishing it.
    pub fn fixture(&self, tag: &str, binary: &[u8]) -> ReleaseFixture {
        ReleaseFixture::build(
            &self.root.artifacts(),
            tag,
            &linux_host(),
            &self.root.config.release,
            binary,
        )
    }
}
