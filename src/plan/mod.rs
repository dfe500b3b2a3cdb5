//! Bootstrap steps and the order they run in
//!
//! Every step names the steps it requires. [`Plan::sequence`] runs Kahn's
//! algorithm over those requirements and returns groups: each step's
//! requirements all sit in earlier groups. Inside a group steps keep the
//! order they were declared in, which makes runs reproducible.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{debug, info};

use crate::topology::Role;
use crate::Error;

/// One unit of work in a quickstart run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// Run the ODB liveness probe
    PingOdb,
    /// Create the ODB tables if missing
    EnsureSchema,
    /// Create the certificate authority
    CreateAuthority,
    /// Issue a role's key pair and certificate
    IssueIdentity(Role),
    /// Create a role's root directory
    CreateRoleDirectory(Role),
    /// Create a role's directory subtree
    PrepareLayout(Role),
    /// Copy a role's identity files into place
    DistributeIdentity(Role),
    /// Write a role's configuration files
    InstallConfiguration(Role),
    /// Insert the cluster and server rows
    RegisterTopology,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::PingOdb => f.write_str("ping-odb"),
            Step::EnsureSchema => f.write_str("ensure-schema"),
            Step::CreateAuthority => f.write_str("create-authority"),
            Step::IssueIdentity(role) => write!(f, "issue-identity({})", role),
            Step::CreateRoleDirectory(role) => write!(f, "create-directory({})", role),
            Step::PrepareLayout(role) => write!(f, "prepare-layout({})", role),
            Step::DistributeIdentity(role) => write!(f, "distribute-identity({})", role),
            Step::InstallConfiguration(role) => write!(f, "install-configuration({})", role),
            Step::RegisterTopology => f.write_str("register-topology"),
        }
    }
}

#[derive(Debug, Clone)]
struct PlannedStep {
    step: Step,
    requires: Vec<Step>,
}

/// Steps with their requirements, in declaration order
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<PlannedStep>,
}

impl Plan {
    /// Create an empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a step and what it requires
    pub fn add(&mut self, step: Step, requires: &[Step]) -> &mut Self {
        self.steps.push(PlannedStep {
            step,
            requires: requires.to_vec(),
        });
        self
    }

    /// The full quickstart: ODB checks, authority, every role, registration
    pub fn quickstart() -> Self {
        let mut plan = Self::new();
        plan.add(Step::PingOdb, &[])
            .add(Step::EnsureSchema, &[Step::PingOdb])
            .add(Step::CreateAuthority, &[Step::EnsureSchema]);

        for role in Role::ALL {
            plan.add(Step::IssueIdentity(role), &[Step::CreateAuthority]);
        }

        // No role directory appears until every identity has been issued
        let issued = Role::ALL.map(Step::IssueIdentity);
        for role in Role::ALL {
            plan.add(Step::CreateRoleDirectory(role), &issued)
                .add(Step::PrepareLayout(role), &[Step::CreateRoleDirectory(role)])
                .add(
                    Step::DistributeIdentity(role),
                    &[Step::IssueIdentity(role), Step::PrepareLayout(role)],
                )
                .add(
                    Step::InstallConfiguration(role),
                    &[Step::DistributeIdentity(role)],
                );
        }

        plan.add(
            Step::RegisterTopology,
            &Role::ALL.map(Step::InstallConfiguration),
        );
        plan
    }

    /// Number of declared steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step was declared
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Requirements of `step`, if it was declared
    pub fn requirements(&self, step: Step) -> Option<&[Step]> {
        self.steps
            .iter()
            .find(|p| p.step == step)
            .map(|p| p.requires.as_slice())
    }

    /// Order the steps into groups with Kahn's algorithm
    ///
    /// Fails on duplicate steps, requirements that were never declared, and
    /// cycles.
    pub fn sequence(&self) -> Result<Vec<Vec<Step>>, Error> {
        let mut declared: HashSet<Step> = HashSet::new();
        for planned in &self.steps {
            if !declared.insert(planned.step) {
                return Err(Error::plan(format!("step {} declared twice", planned.step)));
            }
        }

        let mut pending: HashMap<Step, usize> = HashMap::new();
        for planned in &self.steps {
            for req in &planned.requires {
                if !declared.contains(req) {
                    return Err(Error::plan(format!(
                        "step {} requires undeclared step {}",
                        planned.step, req
                    )));
                }
            }
            let unique: HashSet<&Step> = planned.requires.iter().collect();
            pending.insert(planned.step, unique.len());
        }

        let mut placed: HashSet<Step> = HashSet::new();
        let mut groups: Vec<Vec<Step>> = Vec::new();

        while placed.len() < self.steps.len() {
            let group: Vec<Step> = self
                .steps
                .iter()
                .filter(|p| !placed.contains(&p.step) && pending.get(&p.step) == Some(&0))
                .map(|p| p.step)
                .collect();

            if group.is_empty() {
                let stuck: Vec<String> = self
                    .steps
                    .iter()
                    .filter(|p| !placed.contains(&p.step))
                    .map(|p| p.step.to_string())
                    .collect();
                return Err(Error::plan(format!(
                    "requirement cycle, stuck steps: {}",
                    stuck.join(", ")
                )));
            }

            for planned in &self.steps {
                if placed.contains(&planned.step) {
                    continue;
                }
                let unique: HashSet<&Step> = planned.requires.iter().collect();
                let satisfied = unique.iter().filter(|r| group.contains(r)).count();
                if let Some(count) = pending.get_mut(&planned.step) {
                    *count -= satisfied;
                }
            }

            debug!(group = groups.len(), steps = group.len(), "Computed step group");
            placed.extend(group.iter().copied());
            groups.push(group);
        }

        info!(
            groups = groups.len(),
            steps = self.steps.len(),
            "Computed bootstrap sequence"
        );
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[Step], step: Step) -> usize {
        order
            .iter()
            .position(|s| *s == step)
            .unwrap_or_else(|| panic!("{} not scheduled", step))
    }

    #[test]
    fn every_step_runs_after_its_requirements() {
        let plan = Plan::quickstart();
        let order: Vec<Step> = plan.sequence().unwrap().into_iter().flatten().collect();

        assert_eq!(order.len(), plan.len());
        for planned in &plan.steps {
            for req in &planned.requires {
                assert!(
                    position(&order, *req) < position(&order, planned.step),
                    "{} scheduled before its requirement {}",
                    planned.step,
                    req
                );
            }
        }
    }

    #[test]
    fn ping_comes_first_and_registration_last() {
        let groups = Plan::quickstart().sequence().unwrap();

        assert_eq!(groups.first(), Some(&vec![Step::PingOdb]));
        assert_eq!(groups.last(), Some(&vec![Step::RegisterTopology]));
    }

    #[test]
    fn quickstart_groups_by_level() {
        let groups = Plan::quickstart().sequence().unwrap();
        assert_eq!(groups.len(), 9);

        assert_eq!(groups[2], vec![Step::CreateAuthority]);
        assert_eq!(groups[3], Role::ALL.map(Step::IssueIdentity).to_vec());
        assert_eq!(groups[4], Role::ALL.map(Step::CreateRoleDirectory).to_vec());
        assert_eq!(groups[5], Role::ALL.map(Step::PrepareLayout).to_vec());
        assert_eq!(groups[6], Role::ALL.map(Step::DistributeIdentity).to_vec());
        assert_eq!(groups[7], Role::ALL.map(Step::InstallConfiguration).to_vec());
    }

    #[test]
    fn role_directories_wait_for_every_identity() {
        let plan = Plan::quickstart();
        let order: Vec<Step> = plan.sequence().unwrap().into_iter().flatten().collect();

        let last_issue = Role::ALL
            .iter()
            .map(|r| position(&order, Step::IssueIdentity(*r)))
            .max()
            .unwrap();
        for role in Role::ALL {
            assert!(position(&order, Step::CreateRoleDirectory(role)) > last_issue);
        }
    }

    #[test]
    fn declaration_order_is_kept_within_a_group() {
        let mut plan = Plan::new();
        plan.add(Step::RegisterTopology, &[])
            .add(Step::PingOdb, &[])
            .add(Step::EnsureSchema, &[]);

        assert_eq!(
            plan.sequence().unwrap(),
            vec![vec![Step::RegisterTopology, Step::PingOdb, Step::EnsureSchema]]
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let mut plan = Plan::new();
        plan.add(Step::PingOdb, &[])
            .add(Step::EnsureSchema, &[Step::CreateAuthority])
            .add(Step::CreateAuthority, &[Step::EnsureSchema]);

        let err = plan.sequence().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "{}", msg);
        assert!(msg.contains("ensure-schema"), "{}", msg);
        assert!(!msg.contains("ping-odb"), "{}", msg);
    }

    #[test]
    fn undeclared_requirement_is_rejected() {
        let mut plan = Plan::new();
        plan.add(Step::EnsureSchema, &[Step::PingOdb]);

        let err = plan.sequence().unwrap_err();
        assert!(matches!(err, Error::Plan(msg) if msg.contains("undeclared step ping-odb")));
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let mut plan = Plan::new();
        plan.add(Step::PingOdb, &[]).add(Step::PingOdb, &[]);

        assert!(matches!(plan.sequence(), Err(Error::Plan(_))));
    }

    #[test]
    fn repeated_requirement_counts_once() {
        let mut plan = Plan::new();
        plan.add(Step::PingOdb, &[])
            .add(Step::EnsureSchema, &[Step::PingOdb, Step::PingOdb]);

        assert_eq!(plan.sequence().unwrap().len(), 2);
    }

    #[test]
    fn requirements_are_queryable() {
        let plan = Plan::quickstart();
        assert_eq!(
            plan.requirements(Step::DistributeIdentity(Role::Server)),
            Some(
                &[
                    Step::IssueIdentity(Role::Server),
                    Step::PrepareLayout(Role::Server)
                ][..]
            )
        );
        assert_eq!(plan.requirements(Step::PingOdb), Some(&[][..]));
    }

    #[test]
    fn step_names_are_readable() {
        assert_eq!(Step::PingOdb.to_string(), "ping-odb");
        assert_eq!(
            Step::DistributeIdentity(Role::Server).to_string(),
            "distribute-identity(server)"
        );
    }
}
