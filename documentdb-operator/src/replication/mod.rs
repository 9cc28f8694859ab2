pub mod coordinator;
pub mod placements;

use crate::apis::documentdb_types::{ClusterReplication, DocumentDB, ReplicationRole};
use crate::{Context, Error};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const REPLICATION_TOKEN_PREFIX: &str = "documentdb-replication-token-";
pub const EXTERNAL_ORIGIN_NAME: &str = "documentdb-origin";

/// Ephemeral material allowing a standby (or a demoted former primary) to
/// resume streaming from the current primary. Lives in a ConfigMap only for
/// the duration of a promotion.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationToken {
    pub host: String,
    pub port: String,
    /// Log sequence number the target had reached when the token was cut.
    pub lsn: Option<String>,
}

pub fn token_configmap_name(ddb_name: &str) -> String {
    format!("{}{}", REPLICATION_TOKEN_PREFIX, ddb_name)
}

impl ReplicationToken {
    pub fn to_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert("host".to_string(), self.host.clone());
        data.insert("port".to_string(), self.port.clone());
        if let Some(lsn) = &self.lsn {
            data.insert("lsn".to_string(), lsn.clone());
        }
        data
    }

    pub fn from_data(data: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            host: data.get("host")?.clone(),
            port: data.get("port")?.clone(),
            lsn: data.get("lsn").cloned(),
        })
    }
}

/// Role of a given member cluster for one DocumentDB, derived from spec.
/// `None` means the member is not in the cluster list and must not
/// materialize anything.
pub fn replication_role(
    replication: Option<&ClusterReplication>,
    member_cluster: &str,
) -> Option<ReplicationRole> {
    let rep = replication?;
    if rep.primary == member_cluster {
        Some(ReplicationRole::Primary)
    } else if rep.clusterList.iter().any(|c| c == member_cluster) {
        Some(ReplicationRole::Standby {
            of: rep.primary.clone(),
        })
    } else {
        None
    }
}

/// Validate the P6 invariant: the declared primary must be a member of the
/// cluster list. Violations are terminal and block child creation.
pub fn validate_replication(replication: &ClusterReplication) -> Result<(), Error> {
    if !replication
        .clusterList
        .iter()
        .any(|c| c == &replication.primary)
    {
        return Err(Error::ReplicationConfigError(format!(
            "primary {} is not in clusterList {:?}",
            replication.primary, replication.clusterList
        )));
    }
    Ok(())
}

/// Fetch the replication token for this DocumentDB, if one is currently
/// published in its namespace.
pub async fn read_token(ddb: &DocumentDB, ctx: Arc<Context>) -> Result<Option<ReplicationToken>, Error> {
    let ns = ddb.namespace().unwrap();
    let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
    match cm_api.get(&token_configmap_name(&ddb.name_any())).await {
        Ok(cm) => Ok(cm.data.as_ref().and_then(ReplicationToken::from_data)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replication(primary: &str, list: &[&str]) -> ClusterReplication {
        ClusterReplication {
            fleetEnabled: true,
            primary: primary.to_string(),
            clusterList: list.iter().map(|s| s.to_string()).collect(),
            failoverAfterSeconds: None,
        }
    }

    #[test]
    fn primary_member_gets_the_primary_role() {
        let rep = replication("a", &["a", "b"]);
        assert_eq!(
            replication_role(Some(&rep), "a"),
            Some(ReplicationRole::Primary)
        );
    }

    #[test]
    fn listed_member_gets_a_standby_role_pointing_at_the_primary() {
        let rep = replication("a", &["a", "b"]);
        assert_eq!(
            replication_role(Some(&rep), "b"),
            Some(ReplicationRole::Standby {
                of: "a".to_string()
            })
        );
    }

    #[test]
    fn unlisted_member_materializes_nothing() {
        let rep = replication("a", &["a", "b"]);
        assert_eq!(replication_role(Some(&rep), "c"), None);
    }

    #[test]
    fn primary_must_be_in_cluster_list() {
        let rep = replication("c", &["a", "b"]);
        assert!(validate_replication(&rep).is_err());
        assert!(validate_replication(&replication("a", &["a", "b"])).is_ok());
    }

    #[test]
    fn token_round_trips_through_configmap_data() {
        let token = ReplicationToken {
            host: "52.1.2.3".to_string(),
            port: "5432".to_string(),
            lsn: Some("0/3000060".to_string()),
        };
        assert_eq!(
            ReplicationToken::from_data(&token.to_data()),
            Some(token.clone())
        );
        let mut partial = token.to_data();
        partial.remove("host");
        assert_eq!(ReplicationToken::from_data(&partial), None);
    }
}
