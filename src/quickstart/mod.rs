//! Quickstart orchestrator
//!
//! Runs the bootstrap [`Plan`] group by group, strictly one step at a time:
//!
//! 1. Check the target directory is empty (or creatable) and settings are sane
//! 2. Ping the ODB and make sure its schema exists
//! 3. Create the certificate authority and issue one identity per role
//! 4. Create each role's directories, distribute its identity, write its config
//! 5. Register the cluster and its server in one transaction
//!
//! The first failing step stops the run. The returned [`QuickstartFailure`]
//! names that step, the steps already done and every path the run created, so
//! the caller knows exactly what was left behind.
//!
//! # Example
//!
//! ```no_run
//! use zato_quickstart::config::QuickstartSettings;
//! use zato_quickstart::odb::MemoryOdb;
//! use zato_quickstart::pki::RcgenAuthority;
//! use zato_quickstart::quickstart::Quickstart;
//!
//! # async fn run() {
//! let mut settings = QuickstartSettings::default();
//! settings.target_dir = "/tmp/qs".into();
//! settings.odb.kind = zato_quickstart::config::OdbKind::Sqlite;
//! settings.odb.db_name = "/tmp/qs.db".to_string();
//!
//! let quickstart = Quickstart::new(settings, Box::new(MemoryOdb::new()), Box::new(RcgenAuthority));
//! match quickstart.run().await {
//!     Ok(report) => println!("created {}", report.cluster.name()),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! # }
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::QuickstartSettings;
use crate::distribute::distribute_identity;
use crate::materialize::{
    create_role_directory, install_role_configuration, prepare_role_layout, ClusterArgs,
};
use crate::odb::{Cluster, OdbConnection, Server};
use crate::pki::{AuthorityHandle, CryptoArtifactSet, IdentityAuthority, PkiError};
use crate::plan::{Plan, Step};
use crate::registrar::register_topology;
use crate::topology::ClusterTopology;
use crate::Error;

/// What a successful run produced
#[derive(Debug, Clone)]
pub struct QuickstartReport {
    /// Where every component lives
    pub topology: ClusterTopology,
    /// The registered cluster
    pub cluster: Cluster,
    /// The cluster's first server
    pub server: Server,
}

/// Where and how a run stopped
#[derive(Debug)]
pub struct QuickstartFailure {
    /// The failing step, `None` when the run stopped before the plan started
    pub step: Option<Step>,
    /// Steps that finished, in execution order
    pub completed: Vec<Step>,
    /// Paths the run created, in creation order
    pub materialized: Vec<PathBuf>,
    /// What went wrong
    pub error: Error,
}

impl fmt::Display for QuickstartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "quickstart failed at step {}: {}", step, self.error),
            None => write!(f, "quickstart failed before starting: {}", self.error),
        }
    }
}

impl std::error::Error for QuickstartFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// State threaded between steps of one run
struct RunState {
    topology: ClusterTopology,
    args: ClusterArgs,
    authority: Option<AuthorityHandle>,
    artifacts: Option<CryptoArtifactSet>,
    registered: Option<(Cluster, Server)>,
    completed: Vec<Step>,
    materialized: Vec<PathBuf>,
}

impl RunState {
    fn artifacts_mut(&mut self) -> Result<&mut CryptoArtifactSet, Error> {
        self.artifacts
            .as_mut()
            .ok_or_else(|| Error::plan("no certificate authority has been created"))
    }
}

/// One bootstrap run over a target directory
pub struct Quickstart {
    settings: QuickstartSettings,
    odb: Box<dyn OdbConnection>,
    authority: Box<dyn IdentityAuthority>,
    plan: Plan,
}

impl Quickstart {
    /// Prepare a run; nothing is touched until [`Quickstart::run`]
    pub fn new(
        settings: QuickstartSettings,
        odb: Box<dyn OdbConnection>,
        authority: Box<dyn IdentityAuthority>,
    ) -> Self {
        Self {
            settings,
            odb,
            authority,
            plan: Plan::quickstart(),
        }
    }

    /// The steps this run will execute
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Execute the plan
    pub async fn run(&self) -> Result<QuickstartReport, QuickstartFailure> {
        let not_started = |error: Error| QuickstartFailure {
            step: None,
            completed: Vec::new(),
            materialized: Vec::new(),
            error,
        };

        self.settings.validate().map_err(not_started)?;
        let topology = ClusterTopology::new(&self.settings.target_dir)
            .map_err(|e| not_started(Error::config(format!("cannot resolve target: {}", e))))?;
        check_target(topology.target_dir()).map_err(not_started)?;
        let groups = self.plan.sequence().map_err(not_started)?;

        info!(
            target = %topology.target_dir().display(),
            odb = %self.settings.odb.kind,
            "Starting quickstart"
        );

        let mut state = RunState {
            args: ClusterArgs::from_settings(&self.settings),
            topology,
            authority: None,
            artifacts: None,
            registered: None,
            completed: Vec::new(),
            materialized: Vec::new(),
        };

        let total = self.plan.len();
        for step in groups.into_iter().flatten() {
            debug!(step = %step, "Running step");
            if let Err(error) = self.execute(step, &mut state).await {
                warn!(step = %step, error = %error, "Step failed");
                if self.settings.cleanup_on_failure {
                    cleanup(&state.materialized);
                }
                return Err(QuickstartFailure {
                    step: Some(step),
                    completed: state.completed,
                    materialized: state.materialized,
                    error,
                });
            }
            state.completed.push(step);
            println!("[{}/{}] {}", state.completed.len(), total, describe(step));
        }

        let (cluster, server) = match state.registered {
            Some(registered) => registered,
            None => {
                return Err(QuickstartFailure {
                    step: None,
                    completed: state.completed,
                    materialized: state.materialized,
                    error: Error::plan("plan finished without registering the topology"),
                })
            }
        };

        info!(cluster = %cluster.name(), server = %server.name, "Quickstart complete");
        Ok(QuickstartReport {
            topology: state.topology,
            cluster,
            server,
        })
    }

    async fn execute(&self, step: Step, state: &mut RunState) -> Result<(), Error> {
        match step {
            Step::PingOdb => self.odb.ping().await?,
            Step::EnsureSchema => self.odb.ensure_schema().await?,
            Step::CreateAuthority => {
                ensure_target(state)?;
                let dir = state.topology.ca_dir().to_path_buf();
                fs::create_dir(&dir).map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => PkiError::DirectoryExists(dir.clone()),
                    _ => PkiError::Io(e),
                })?;
                state.materialized.push(dir.clone());

                let handle = self.authority.create_authority(&dir)?;
                state.artifacts = Some(CryptoArtifactSet::new(handle.chain_path()));
                state.authority = Some(handle);
            }
            Step::IssueIdentity(role) => {
                let handle = state
                    .authority
                    .as_ref()
                    .ok_or_else(|| Error::plan(format!("{} issued before the authority", role)))?;
                let identity = self.authority.issue_component_identity(handle, role)?;

                state.materialized.push(identity.private_key.clone());
                state.materialized.extend(identity.public_key.clone());
                state.materialized.push(identity.certificate.clone());
                state.artifacts_mut()?.insert(identity);
            }
            Step::CreateRoleDirectory(role) => {
                ensure_target(state)?;
                let dir = state.topology.role_dir(role).to_path_buf();
                create_role_directory(role, &dir)?;
                state.materialized.push(dir);
            }
            Step::PrepareLayout(role) => {
                let created = prepare_role_layout(role, state.topology.role_dir(role))?;
                state.materialized.extend(created);
            }
            Step::DistributeIdentity(role) => {
                let artifacts = state
                    .artifacts
                    .as_ref()
                    .ok_or_else(|| Error::plan("no certificate authority has been created"))?;
                let identity = artifacts
                    .get(role)
                    .ok_or_else(|| Error::plan(format!("no identity issued for {}", role)))?;
                let written = distribute_identity(
                    role,
                    identity,
                    artifacts.chain(),
                    &state.topology.identity_dir(role),
                )?;
                state.materialized.extend(written);
            }
            Step::InstallConfiguration(role) => {
                let written =
                    install_role_configuration(role, state.topology.role_dir(role), &state.args)?;
                state.materialized.extend(written);
            }
            Step::RegisterTopology => {
                let registered = register_topology(self.odb.as_ref(), &self.settings).await?;
                state.registered = Some(registered);
            }
        }
        Ok(())
    }
}

/// Progress line for a finished step
fn describe(step: Step) -> String {
    match step {
        Step::PingOdb => "ODB ping OK".to_string(),
        Step::EnsureSchema => "ODB schema in place".to_string(),
        Step::CreateAuthority => "Certificate authority created".to_string(),
        Step::IssueIdentity(role) => {
            format!("Crypto material generated for the {}", role.describe())
        }
        Step::CreateRoleDirectory(role) => {
            format!("Directory created for the {}", role.describe())
        }
        Step::PrepareLayout(role) => format!("Layout prepared for the {}", role.describe()),
        Step::DistributeIdentity(role) => {
            format!("Crypto material copied to the {}", role.describe())
        }
        Step::InstallConfiguration(role) => format!("The {} created", role.describe()),
        Step::RegisterTopology => "Cluster and server registered in the ODB".to_string(),
    }
}

/// The target must be an empty directory, or absent with an existing parent
fn check_target(target: &Path) -> Result<(), Error> {
    match fs::read_dir(target) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(Error::config(format!(
                    "target directory {} is not empty",
                    target.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => match target.parent() {
            Some(parent) if parent.is_dir() => Ok(()),
            _ => Err(Error::config(format!(
                "cannot create target directory {}: parent does not exist",
                target.display()
            ))),
        },
        Err(e) => Err(Error::config(format!(
            "cannot use target directory {}: {}",
            target.display(),
            e
        ))),
    }
}

/// Create the target directory on first use, after the ODB checks passed
fn ensure_target(state: &mut RunState) -> Result<(), Error> {
    let target = state.topology.target_dir();
    if target.is_dir() {
        return Ok(());
    }
    fs::create_dir(target).map_err(|e| {
        Error::config(format!(
            "cannot create target directory {}: {}",
            target.display(),
            e
        ))
    })?;
    state.materialized.push(target.to_path_buf());
    Ok(())
}

/// Remove created paths, newest first, ignoring what is already gone
fn cleanup(materialized: &[PathBuf]) {
    println!("\n[Cleanup] Removing files created by the failed run...");
    for path in materialized.iter().rev() {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "Removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Cleanup failed"),
        }
    }
}
