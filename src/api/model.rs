//! Request and response payloads of the cluster API, and the validation
//! rules applied to them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provision::SUPPORTED_PROVIDERS;
use crate::store::{Cluster, ClusterSpec, ClusterState, ProvisionerSpec};

/// Desired states a user may request when creating a cluster.
const VALID_CREATE_STATES: &[&str] = &["planned", "provisioned", "installed"];

/// Desired states a user may request when updating a cluster.
const VALID_UPDATE_STATES: &[&str] = &["planned", "provisioned", "installed", "destroyed"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desired_state: String,
    #[serde(default)]
    pub etcd_count: i64,
    #[serde(default)]
    pub master_count: i64,
    #[serde(default)]
    pub worker_count: i64,
    #[serde(default)]
    pub ingress_count: i64,
    #[serde(default)]
    pub provisioner: ProvisionerRequest,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerRequest {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl ClusterRequest {
    /// Build the spec persisted in the store. Returns `None` when the
    /// desired state does not parse; validation reports that case to the
    /// caller first.
    pub fn to_spec(&self) -> Option<ClusterSpec> {
        let desired_state = ClusterState::parse(&self.desired_state)?;
        Some(ClusterSpec {
            desired_state,
            etcd_count: self.etcd_count as u32,
            master_count: self.master_count as u32,
            worker_count: self.worker_count as u32,
            ingress_count: self.ingress_count as u32,
            provisioner: ProvisionerSpec {
                provider: self.provisioner.provider.clone(),
                options: self.provisioner.options.clone(),
                secrets: self.provisioner.secrets.clone(),
            },
        })
    }
}

/// A cluster as reported by the API. There is no secrets field: responses
/// structurally cannot carry credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    pub name: String,
    pub desired_state: ClusterState,
    pub current_state: Option<ClusterState>,
    pub cluster_ip: Option<String>,
    pub waiting_for_manual_retry: bool,
    pub etcd_count: u32,
    pub master_count: u32,
    pub worker_count: u32,
    pub ingress_count: u32,
    pub provisioner: ProvisionerResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerResponse {
    pub provider: String,
    pub options: BTreeMap<String, String>,
}

impl ClusterResponse {
    pub fn from_cluster(name: &str, cluster: &Cluster) -> ClusterResponse {
        ClusterResponse {
            name: name.to_string(),
            desired_state: cluster.spec.desired_state,
            current_state: cluster.status.current_state,
            cluster_ip: cluster.status.cluster_ip.clone(),
            waiting_for_manual_retry: cluster.status.waiting_for_manual_retry,
            etcd_count: cluster.spec.etcd_count,
            master_count: cluster.spec.master_count,
            worker_count: cluster.spec.worker_count,
            ingress_count: cluster.spec.ingress_count,
            provisioner: ProvisionerResponse {
                provider: cluster.spec.provisioner.provider.clone(),
                options: cluster.spec.provisioner.options.clone(),
            },
        }
    }
}

#[derive(Default)]
struct Validator {
    errs: Vec<String>,
}

impl Validator {
    fn add(&mut self, err: impl Into<String>) {
        self.errs.push(err.into());
    }

    fn result(self) -> Result<(), Vec<String>> {
        if self.errs.is_empty() {
            Ok(())
        } else {
            Err(self.errs)
        }
    }
}

pub fn validate_create(req: &ClusterRequest) -> Result<(), Vec<String>> {
    let mut v = Validator::default();
    if req.name.is_empty() {
        v.add("name cannot be empty");
    }
    if req.desired_state.is_empty() {
        v.add("desiredState cannot be empty");
    } else if !VALID_CREATE_STATES.contains(&req.desired_state.as_str()) {
        v.add(format!(
            "{} is not a valid desiredState, options are: {:?}",
            req.desired_state, VALID_CREATE_STATES
        ));
    }
    if req.etcd_count <= 0 {
        v.add("cluster.etcdCount must be greater than 0");
    }
    if req.master_count <= 0 {
        v.add("cluster.masterCount must be greater than 0");
    }
    if req.worker_count <= 0 {
        v.add("cluster.workerCount must be greater than 0");
    }
    if req.ingress_count < 0 {
        v.add("cluster.ingressCount must be greater than or equal to 0");
    }
    if req.provisioner.provider.is_empty() {
        v.add("provisioner.provider cannot be empty");
    } else if !SUPPORTED_PROVIDERS.contains(&req.provisioner.provider.as_str()) {
        v.add(format!(
            "{} is not a valid provisioner.provider, options are: {:?}",
            req.provisioner.provider, SUPPORTED_PROVIDERS
        ));
    }
    v.result()
}

/// Validate that the requested changes can be applied to the stored
/// cluster.
pub fn validate_update(
    name: &str,
    req: &ClusterRequest,
    in_store: &Cluster,
) -> Result<(), Vec<String>> {
    let mut v = Validator::default();
    if name != req.name {
        v.add("name must match the cluster requested");
    }
    if req.desired_state.is_empty() {
        v.add("desiredState cannot be empty");
    } else if !VALID_UPDATE_STATES.contains(&req.desired_state.as_str()) {
        v.add(format!(
            "{} is not a valid desiredState, options are: {:?}",
            req.desired_state, VALID_UPDATE_STATES
        ));
    }
    if req.etcd_count != 0 && req.etcd_count != i64::from(in_store.spec.etcd_count) {
        v.add("cluster.etcdCount cannot be modified");
    }
    // Adding and removing master, worker, or ingress nodes is allowed.
    if req.master_count <= 0 {
        v.add("cluster.masterCount must be greater than 0");
    }
    if req.worker_count <= 0 {
        v.add("cluster.workerCount must be greater than 0");
    }
    if req.ingress_count < 0 {
        v.add("cluster.ingressCount must be greater than or equal to 0");
    }
    v.result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ClusterStatus;

    fn valid_request() -> ClusterRequest {
        ClusterRequest {
            name: "c1".to_string(),
            desired_state: "installed".to_string(),
            etcd_count: 1,
            master_count: 1,
            worker_count: 1,
            ingress_count: 0,
            provisioner: ProvisionerRequest {
                provider: "aws".to_string(),
                options: BTreeMap::from([("region".to_string(), "us-east-1".to_string())]),
                secrets: BTreeMap::from([("AWS_ACCESS_KEY_ID".to_string(), "AKIA".to_string())]),
            },
        }
    }

    #[test]
    fn a_valid_create_request_passes() {
        assert!(validate_create(&valid_request()).is_ok());
    }

    #[test]
    fn create_validation_reports_every_problem() {
        let mut req = valid_request();
        req.name = String::new();
        req.desired_state = "destroyed".to_string();
        req.etcd_count = 0;
        req.ingress_count = -1;
        req.provisioner.provider = "digitalocean".to_string();

        let errs = validate_create(&req).unwrap_err();
        assert!(errs.contains(&"name cannot be empty".to_string()));
        assert!(errs.contains(&"cluster.etcdCount must be greater than 0".to_string()));
        assert!(errs.contains(&"cluster.ingressCount must be greater than or equal to 0".to_string()));
        assert!(errs.iter().any(|e| e.contains("not a valid desiredState")));
        assert!(errs.iter().any(|e| e.contains("not a valid provisioner.provider")));
    }

    #[test]
    fn updates_cannot_modify_the_etcd_count() {
        let stored = Cluster {
            spec: valid_request().to_spec().unwrap(),
            status: ClusterStatus::default(),
        };
        let mut req = valid_request();
        req.etcd_count = 3;

        let errs = validate_update("c1", &req, &stored).unwrap_err();
        assert_eq!(errs, vec!["cluster.etcdCount cannot be modified".to_string()]);

        // Leaving the count unset or equal to the stored value is fine.
        let mut req = valid_request();
        req.etcd_count = 0;
        assert!(validate_update("c1", &req, &stored).is_ok());
    }

    #[test]
    fn updates_may_request_destruction() {
        let stored = Cluster {
            spec: valid_request().to_spec().unwrap(),
            status: ClusterStatus::default(),
        };
        let mut req = valid_request();
        req.desired_state = "destroyed".to_string();
        assert!(validate_update("c1", &req, &stored).is_ok());
    }

    #[test]
    fn update_name_must_match_the_path() {
        let stored = Cluster {
            spec: valid_request().to_spec().unwrap(),
            status: ClusterStatus::default(),
        };
        let errs = validate_update("other", &valid_request(), &stored).unwrap_err();
        assert_eq!(errs, vec!["name must match the cluster requested".to_string()]);
    }

    #[test]
    fn responses_never_contain_secrets() {
        let cluster = Cluster {
            spec: valid_request().to_spec().unwrap(),
            status: ClusterStatus {
                current_state: Some(ClusterState::Installed),
                waiting_for_manual_retry: false,
                cluster_ip: Some("lb.example.com".to_string()),
            },
        };
        let response = ClusterResponse::from_cluster("c1", &cluster);
        let raw = serde_json::to_string(&response).unwrap();
        assert!(!raw.contains("secrets"));
        assert!(!raw.contains("AKIA"));
        assert!(raw.contains("\"provider\":\"aws\""));
    }
}
