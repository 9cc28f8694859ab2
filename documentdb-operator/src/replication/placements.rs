// Hand-carried contract CRD consumed by the external fleet placement
// controller, kept in the generated style. The coordinator writes the spec;
// the fleet controller reports convergence per member cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PlacementSpec declares which member clusters receive a resource.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "placement.documentdb.io",
    version = "v1alpha1",
    kind = "Placement",
    plural = "placements"
)]
#[kube(namespaced)]
#[kube(status = "PlacementStatus")]
pub struct PlacementSpec {
    /// Member clusters that receive the placed resource
    #[serde(rename = "clusterList")]
    pub cluster_list: Vec<String>,
    /// Kind of the placed resource
    #[serde(rename = "resourceKind")]
    pub resource_kind: String,
    /// Name of the placed resource
    #[serde(rename = "resourceName")]
    pub resource_name: String,
}

/// PlacementStatus reports where the placement has converged.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct PlacementStatus {
    /// Member clusters where the resource has been materialized
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "placedClusters"
    )]
    pub placed_clusters: Option<Vec<String>>,
}

impl Placement {
    pub fn converged_on(&self, cluster: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.placed_clusters.as_ref())
            .map(|placed| placed.iter().any(|c| c == cluster))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_is_per_cluster() {
        let mut placement = Placement::new(
            "sample",
            PlacementSpec {
                cluster_list: vec!["a".to_string(), "b".to_string()],
                resource_kind: "DocumentDB".to_string(),
                resource_name: "sample".to_string(),
            },
        );
        assert!(!placement.converged_on("a"));
        placement.status = Some(PlacementStatus {
            placed_clusters: Some(vec!["a".to_string()]),
        });
        assert!(placement.converged_on("a"));
        assert!(!placement.converged_on("b"));
    }
}
