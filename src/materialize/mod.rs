//! Component materialization: role directories, their layout and configuration
//!
//! Each role gets a root directory that must not exist yet, a fixed subtree
//! underneath it, and a set of default configuration files rendered from the
//! templates in `templates/`. Nothing here touches the network or the ODB.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{
    Endpoint, OdbKind, QuickstartSettings, DEFAULT_LB_FRONTEND_PORT, DEFAULT_SERVER_PORT,
    DEFAULT_ZATO_ADMIN_PORT,
};
use crate::topology::{Role, CA_CHAIN_FILE};

/// Materialization errors
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The role directory is already there
    #[error("directory already exists: {0}")]
    DirectoryExists(PathBuf),

    /// Filesystem failure
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path being created or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A configuration file could not be written
    #[error("cannot write configuration {path}: {reason}")]
    ConfigWrite {
        /// Configuration file path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl MaterializeError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// ODB values visible to configuration templates
#[derive(Clone, Debug, Serialize)]
pub struct OdbArgs {
    /// Engine
    pub kind: OdbKind,
    /// Host
    pub host: String,
    /// Effective port
    pub port: u16,
    /// User
    pub user: String,
    /// Database name
    pub db_name: String,
    /// Optional schema
    pub schema: Option<String>,
}

/// Broker values visible to configuration templates
#[derive(Clone, Debug, Serialize)]
pub struct BrokerArgs {
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// User
    pub user: String,
}

/// Cluster-wide values every role configuration is rendered with
///
/// Carries no secrets, so passwords never reach the rendered files.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterArgs {
    /// Operational database
    pub odb: OdbArgs,
    /// Messaging broker
    pub broker: BrokerArgs,
    /// Load-balancer agent address
    pub lb_agent: Endpoint,
    /// Security server address
    pub security_server: Endpoint,
    /// Port the server listens on
    pub server_port: u16,
    /// Port the load balancer accepts HTTP on
    pub lb_frontend_port: u16,
    /// Port of the ZatoAdmin web console
    pub zato_admin_port: u16,
}

impl ClusterArgs {
    /// Derive template values from the run settings
    pub fn from_settings(settings: &QuickstartSettings) -> Self {
        Self {
            odb: OdbArgs {
                kind: settings.odb.kind,
                host: settings.odb.host.clone(),
                port: settings.odb.port(),
                user: settings.odb.user.clone(),
                db_name: settings.odb.db_name.clone(),
                schema: settings.odb.schema.clone(),
            },
            broker: BrokerArgs {
                host: settings.broker.host.clone(),
                port: settings.broker.port,
                user: settings.broker.user.clone(),
            },
            lb_agent: settings.lb_agent.clone(),
            security_server: settings.security_server.clone(),
            server_port: DEFAULT_SERVER_PORT,
            lb_frontend_port: DEFAULT_LB_FRONTEND_PORT,
            zato_admin_port: DEFAULT_ZATO_ADMIN_PORT,
        }
    }
}

/// Identity file names a configuration refers to
#[derive(Serialize)]
struct IdentityFiles {
    private_key: String,
    public_key: Option<String>,
    certificate: String,
    ca_chain: &'static str,
}

impl IdentityFiles {
    fn for_role(role: Role) -> Self {
        Self {
            private_key: role.private_key_file(),
            public_key: role.needs_public_key().then(|| role.public_key_file()),
            certificate: role.certificate_file(),
            ca_chain: CA_CHAIN_FILE,
        }
    }
}

const TEMPLATES: [(&str, &str); 6] = [
    ("lb-agent.conf", include_str!("templates/lb-agent.conf")),
    ("zato.config", include_str!("templates/zato.config")),
    ("server.conf", include_str!("templates/server.conf")),
    ("logging.conf", include_str!("templates/logging.conf")),
    ("zato-admin.conf", include_str!("templates/zato-admin.conf")),
    ("security-server.conf", include_str!("templates/security-server.conf")),
];

/// Subdirectories created under each role's root
pub fn role_layout(role: Role) -> &'static [&'static str] {
    match role {
        Role::LoadBalancer => &["config", "logs"],
        Role::Server => &["config/repo", "logs", "pickup-dir"],
        Role::ZatoAdmin => &["config", "logs"],
        Role::SecurityServer => &["config", "logs"],
    }
}

/// Configuration files of a role: path relative to the role root and template name
pub fn role_config_files(role: Role) -> &'static [(&'static str, &'static str)] {
    match role {
        Role::LoadBalancer => &[
            ("config/lb-agent.conf", "lb-agent.conf"),
            ("config/zato.config", "zato.config"),
        ],
        Role::Server => &[
            ("config/repo/server.conf", "server.conf"),
            ("config/repo/logging.conf", "logging.conf"),
        ],
        Role::ZatoAdmin => &[("config/zato-admin.conf", "zato-admin.conf")],
        Role::SecurityServer => &[("config/security-server.conf", "security-server.conf")],
    }
}

/// Renders role configuration templates
pub struct ConfigRenderer {
    env: Environment<'static>,
}

impl ConfigRenderer {
    /// Load every bundled template with strict undefined handling
    pub fn new() -> Result<Self, MaterializeError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for (name, source) in TEMPLATES {
            env.add_template(name, source)?;
        }
        Ok(Self { env })
    }

    /// Render the named template for `role`
    pub fn render(
        &self,
        template: &str,
        role: Role,
        role_dir: &Path,
        args: &ClusterArgs,
    ) -> Result<String, MaterializeError> {
        let tmpl = self.env.get_template(template)?;
        let rendered = tmpl.render(context! {
            cluster => args,
            files => IdentityFiles::for_role(role),
            role => role.slug(),
            logs_dir => role_dir.join("logs").display().to_string(),
        })?;
        Ok(rendered)
    }
}

/// Create the root directory of a role
///
/// The parent must exist and `path` must not.
pub fn create_role_directory(role: Role, path: &Path) -> Result<(), MaterializeError> {
    match fs::create_dir(path) {
        Ok(()) => {
            debug!(role = %role, path = %path.display(), "Created role directory");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(MaterializeError::DirectoryExists(path.to_path_buf()))
        }
        Err(e) => Err(MaterializeError::io(path, e)),
    }
}

/// Create the nested subtree of a role, returning every directory created
pub fn prepare_role_layout(role: Role, path: &Path) -> Result<Vec<PathBuf>, MaterializeError> {
    let mut created = Vec::new();
    for relative in role_layout(role) {
        let mut current = path.to_path_buf();
        for component in Path::new(relative).components() {
            current.push(component);
            if current.is_dir() {
                continue;
            }
            fs::create_dir(&current).map_err(|e| MaterializeError::io(&current, e))?;
            created.push(current.clone());
        }
    }
    debug!(role = %role, dirs = created.len(), "Prepared role layout");
    Ok(created)
}

/// Render and write the default configuration of a role
///
/// Files are created exclusively. The server's configuration is only written
/// once its public key has been distributed. The key is checked for presence
/// only: nothing is encrypted with it, so the rendered `password=` entries stay
/// empty and credentials are supplied to the server separately.
pub fn install_role_configuration(
    role: Role,
    path: &Path,
    args: &ClusterArgs,
) -> Result<Vec<PathBuf>, MaterializeError> {
    if role.needs_public_key() {
        let public_key = path
            .join(role.identity_subdir())
            .join(role.public_key_file());
        if !public_key.is_file() {
            let (config, _) = role_config_files(role)[0];
            return Err(MaterializeError::ConfigWrite {
                path: path.join(config),
                reason: format!("public key {} is not in place", public_key.display()),
            });
        }
    }

    let renderer = ConfigRenderer::new()?;
    let mut written = Vec::new();
    for (relative, template) in role_config_files(role) {
        let content = renderer.render(template, role, path, args)?;
        let target = path.join(relative);
        write_config(&target, &content)?;
        written.push(target);
    }

    info!(role = %role, files = written.len(), "Installed role configuration");
    Ok(written)
}

fn write_config(path: &Path, content: &str) -> Result<(), MaterializeError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| MaterializeError::ConfigWrite {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    file.write_all(content.as_bytes())
        .map_err(|e| MaterializeError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn args() -> ClusterArgs {
        let mut settings = QuickstartSettings::default();
        settings.odb.host = "db.local".to_string();
        settings.odb.user = "zato".to_string();
        settings.odb.password = "secret-password".to_string();
        settings.odb.db_name = "zato_odb".to_string();
        settings.broker.password = "broker-secret".to_string();
        ClusterArgs::from_settings(&settings)
    }

    fn materialized(tmp: &TempDir, role: Role) -> PathBuf {
        let dir = tmp.path().join(role.dir_name());
        create_role_directory(role, &dir).unwrap();
        prepare_role_layout(role, &dir).unwrap();
        dir
    }

    #[test]
    fn creating_a_role_directory_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("server");

        create_role_directory(Role::Server, &dir).unwrap();
        let err = create_role_directory(Role::Server, &dir).unwrap_err();

        assert!(matches!(err, MaterializeError::DirectoryExists(p) if p == dir));
    }

    #[test]
    fn missing_parent_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("absent").join("server");

        let err = create_role_directory(Role::Server, &dir).unwrap_err();
        assert!(matches!(err, MaterializeError::Io { .. }));
    }

    #[rstest]
    #[case::load_balancer(Role::LoadBalancer, &["config", "logs"])]
    #[case::server(Role::Server, &["config", "config/repo", "logs", "pickup-dir"])]
    #[case::zato_admin(Role::ZatoAdmin, &["config", "logs"])]
    #[case::security_server(Role::SecurityServer, &["config", "logs"])]
    fn layout_per_role(#[case] role: Role, #[case] expected: &[&str]) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(role.dir_name());
        create_role_directory(role, &dir).unwrap();

        let created = prepare_role_layout(role, &dir).unwrap();

        let expected: Vec<PathBuf> = expected.iter().map(|p| dir.join(p)).collect();
        assert_eq!(created, expected);
        assert!(created.iter().all(|p| p.is_dir()));
    }

    #[test]
    fn server_config_requires_public_key() {
        let tmp = TempDir::new().unwrap();
        let dir = materialized(&tmp, Role::Server);

        let err = install_role_configuration(Role::Server, &dir, &args()).unwrap_err();

        assert!(matches!(err, MaterializeError::ConfigWrite { .. }));
        assert!(!dir.join("config/repo/server.conf").exists());
        assert!(!dir.join("config/repo/logging.conf").exists());
    }

    #[test]
    fn server_config_references_distributed_files() {
        let tmp = TempDir::new().unwrap();
        let dir = materialized(&tmp, Role::Server);
        fs::write(dir.join("config/repo/zs-pub-key.pem"), "pub").unwrap();

        let written = install_role_configuration(Role::Server, &dir, &args()).unwrap();
        assert_eq!(written.len(), 2);

        let server_conf = fs::read_to_string(dir.join("config/repo/server.conf")).unwrap();
        assert!(server_conf.contains("priv_key_location=zs-priv-key.pem"));
        assert!(server_conf.contains("pub_key_location=zs-pub-key.pem"));
        assert!(server_conf.contains("ca_certs_location=ca-chain.pem"));
        assert!(server_conf.contains("engine=postgresql"));
        assert!(server_conf.contains("host=db.local"));
        assert!(server_conf.contains("port=5432"));
        assert!(server_conf.contains("agent_port=20151"));
        assert!(!server_conf.contains("secret-password"));
        assert_eq!(server_conf.matches("\npassword=\n").count(), 2);
        assert!(!server_conf.contains("broker-secret"));
        assert!(!server_conf.contains("schema="));

        let logging = fs::read_to_string(dir.join("config/repo/logging.conf")).unwrap();
        assert!(logging.contains(&format!("{}/server.log", dir.join("logs").display())));
    }

    #[test]
    fn schema_is_rendered_when_set() {
        let tmp = TempDir::new().unwrap();
        let dir = materialized(&tmp, Role::Server);
        fs::write(dir.join("config/repo/zs-pub-key.pem"), "pub").unwrap();

        let mut args = args();
        args.odb.schema = Some("zato_schema".to_string());
        install_role_configuration(Role::Server, &dir, &args).unwrap();

        let server_conf = fs::read_to_string(dir.join("config/repo/server.conf")).unwrap();
        assert!(server_conf.contains("schema=zato_schema"));
    }

    #[rstest]
    #[case::load_balancer(Role::LoadBalancer, "config/lb-agent.conf", "keyfile=./lba-priv-key.pem")]
    #[case::zato_admin(Role::ZatoAdmin, "config/zato-admin.conf", "cert_location=zato-admin-cert.pem")]
    #[case::security_server(
        Role::SecurityServer,
        "config/security-server.conf",
        "keyfile=security-server-priv-key.pem"
    )]
    fn role_config_names_its_identity(
        #[case] role: Role,
        #[case] config: &str,
        #[case] needle: &str,
    ) {
        let tmp = TempDir::new().unwrap();
        let dir = materialized(&tmp, role);

        let written = install_role_configuration(role, &dir, &args()).unwrap();

        assert_eq!(written.len(), role_config_files(role).len());
        let content = fs::read_to_string(dir.join(config)).unwrap();
        assert!(content.contains(needle), "{} missing from {}", needle, config);
    }

    #[test]
    fn load_balancer_routes_to_the_server() {
        let tmp = TempDir::new().unwrap();
        let dir = materialized(&tmp, Role::LoadBalancer);

        install_role_configuration(Role::LoadBalancer, &dir, &args()).unwrap();

        let haproxy = fs::read_to_string(dir.join("config/zato.config")).unwrap();
        assert!(haproxy.contains(&format!("127.0.0.1:{}", DEFAULT_SERVER_PORT)));
        assert!(haproxy.contains(&format!("bind 0.0.0.0:{}", DEFAULT_LB_FRONTEND_PORT)));
    }

    #[test]
    fn configuration_is_never_overwritten() {
        let tmp = TempDir::new().unwrap();
        let dir = materialized(&tmp, Role::ZatoAdmin);
        fs::write(dir.join("config/zato-admin.conf"), "operator edits").unwrap();

        let err = install_role_configuration(Role::ZatoAdmin, &dir, &args()).unwrap_err();

        assert!(matches!(err, MaterializeError::ConfigWrite { .. }));
        assert_eq!(
            fs::read_to_string(dir.join("config/zato-admin.conf")).unwrap(),
            "operator edits"
        );
    }

    #[test]
    fn every_template_renders_for_its_role() {
        let renderer = ConfigRenderer::new().unwrap();
        for role in Role::ALL {
            for (_, template) in role_config_files(role) {
                let out = renderer
                    .render(template, role, Path::new("/qs/role"), &args())
                    .unwrap();
                assert!(!out.contains("{{"), "unrendered markup in {}", template);
            }
        }
    }
}
