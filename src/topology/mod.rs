//! Cluster topology: the fixed set of component roles and where each one lives
//!
//! A [`ClusterTopology`] is computed once from the target directory at the start
//! of a run and threaded through every step. Nothing downstream rediscovers the
//! layout by scanning the filesystem.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Directory holding the certificate authority
pub const CA_DIR: &str = "ca";

/// Name of the shared authority chain file copied into every role
pub const CA_CHAIN_FILE: &str = "ca-chain.pem";

/// A component kind provisioned by the quickstart
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Security gateway
    SecurityServer,
    /// Load-balancer agent
    LoadBalancer,
    /// Application server
    Server,
    /// Administrative web console
    ZatoAdmin,
}

impl Role {
    /// Every role, in provisioning order
    pub const ALL: [Role; 4] = [
        Role::SecurityServer,
        Role::LoadBalancer,
        Role::Server,
        Role::ZatoAdmin,
    ];

    /// Directory name under the target directory
    pub fn dir_name(&self) -> &'static str {
        match self {
            Role::SecurityServer => "security-server",
            Role::LoadBalancer => "load-balancer",
            Role::Server => "server",
            Role::ZatoAdmin => "zato-admin",
        }
    }

    /// Short identifier used for files issued by the authority
    pub fn slug(&self) -> &'static str {
        match self {
            Role::SecurityServer => "security-server",
            Role::LoadBalancer => "lb-agent",
            Role::Server => "server",
            Role::ZatoAdmin => "zato-admin",
        }
    }

    /// Prefix of the identity files inside the role directory
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Role::SecurityServer => "security-server",
            Role::LoadBalancer => "lba",
            Role::Server => "zs",
            Role::ZatoAdmin => "zato-admin",
        }
    }

    /// Private key file name inside the identity directory
    pub fn private_key_file(&self) -> String {
        format!("{}-priv-key.pem", self.file_prefix())
    }

    /// Public key file name inside the identity directory
    pub fn public_key_file(&self) -> String {
        format!("{}-pub-key.pem", self.file_prefix())
    }

    /// Certificate file name inside the identity directory
    pub fn certificate_file(&self) -> String {
        format!("{}-cert.pem", self.file_prefix())
    }

    /// Common name placed in the role's certificate subject
    pub fn common_name(&self) -> String {
        format!("zato-quickstart-{}", self.slug())
    }

    /// Only the server keeps its public key next to the private one
    pub fn needs_public_key(&self) -> bool {
        matches!(self, Role::Server)
    }

    /// Path, relative to the role directory, that receives identity files
    pub fn identity_subdir(&self) -> &'static Path {
        match self {
            Role::LoadBalancer => Path::new("config"),
            Role::Server => Path::new("config/repo"),
            Role::SecurityServer | Role::ZatoAdmin => Path::new(""),
        }
    }

    /// Human-readable description for progress output
    pub fn describe(&self) -> &'static str {
        match self {
            Role::SecurityServer => "security server",
            Role::LoadBalancer => "load-balancer agent",
            Role::Server => "server",
            Role::ZatoAdmin => "ZatoAdmin web console",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Absolute paths of every component for one bootstrap run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    target_dir: PathBuf,
    ca_dir: PathBuf,
    roles: BTreeMap<Role, PathBuf>,
}

impl ClusterTopology {
    /// Compute the layout under `target_dir`
    ///
    /// Relative targets are resolved against the current working directory so
    /// every path handed out is absolute.
    pub fn new(target_dir: &Path) -> std::io::Result<Self> {
        let target_dir = if target_dir.is_absolute() {
            target_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(target_dir)
        };

        let roles = Role::ALL
            .iter()
            .map(|role| (*role, target_dir.join(role.dir_name())))
            .collect();

        Ok(Self {
            ca_dir: target_dir.join(CA_DIR),
            target_dir,
            roles,
        })
    }

    /// The directory everything is created under
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// The certificate authority directory
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Root directory of a role
    pub fn role_dir(&self, role: Role) -> &Path {
        // Every role is inserted by the constructor
        &self.roles[&role]
    }

    /// Directory that receives the role's identity files
    pub fn identity_dir(&self, role: Role) -> PathBuf {
        let subdir = role.identity_subdir();
        if subdir.as_os_str().is_empty() {
            self.role_dir(role).to_path_buf()
        } else {
            self.role_dir(role).join(subdir)
        }
    }

    /// Iterate over all roles and their directories
    pub fn roles(&self) -> impl Iterator<Item = (Role, &Path)> {
        self.roles.iter().map(|(role, path)| (*role, path.as_path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_lays_out_five_directories() {
        let topology = ClusterTopology::new(Path::new("/srv/qs")).unwrap();

        assert_eq!(topology.ca_dir(), Path::new("/srv/qs/ca"));
        assert_eq!(
            topology.role_dir(Role::LoadBalancer),
            Path::new("/srv/qs/load-balancer")
        );
        assert_eq!(topology.role_dir(Role::Server), Path::new("/srv/qs/server"));
        assert_eq!(
            topology.role_dir(Role::ZatoAdmin),
            Path::new("/srv/qs/zato-admin")
        );
        assert_eq!(
            topology.role_dir(Role::SecurityServer),
            Path::new("/srv/qs/security-server")
        );
        assert_eq!(topology.roles().count(), 4);
    }

    #[test]
    fn relative_target_becomes_absolute() {
        let topology = ClusterTopology::new(Path::new("relative/dir")).unwrap();
        assert!(topology.target_dir().is_absolute());
        assert!(topology.ca_dir().is_absolute());
        assert!(topology.roles().all(|(_, path)| path.is_absolute()));
    }

    #[test]
    fn identity_dirs_follow_role_conventions() {
        let topology = ClusterTopology::new(Path::new("/qs")).unwrap();

        assert_eq!(
            topology.identity_dir(Role::Server),
            PathBuf::from("/qs/server/config/repo")
        );
        assert_eq!(
            topology.identity_dir(Role::LoadBalancer),
            PathBuf::from("/qs/load-balancer/config")
        );
        assert_eq!(
            topology.identity_dir(Role::ZatoAdmin),
            PathBuf::from("/qs/zato-admin")
        );
        assert_eq!(
            topology.identity_dir(Role::SecurityServer),
            PathBuf::from("/qs/security-server")
        );
    }

    #[test]
    fn identity_file_names_use_role_prefix() {
        assert_eq!(Role::LoadBalancer.private_key_file(), "lba-priv-key.pem");
        assert_eq!(Role::Server.public_key_file(), "zs-pub-key.pem");
        assert_eq!(Role::ZatoAdmin.certificate_file(), "zato-admin-cert.pem");
        assert_eq!(
            Role::SecurityServer.certificate_file(),
            "security-server-cert.pem"
        );
    }

    #[test]
    fn only_server_keeps_public_key() {
        let with_pub: Vec<Role> = Role::ALL
            .into_iter()
            .filter(Role::needs_public_key)
            .collect();
        assert_eq!(with_pub, vec![Role::Server]);
    }
}
