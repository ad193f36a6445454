//! # Reference Tables
//!
//! Static lookup data used by the enricher: per-instance hardware specs,
//! per-region power cost, per-GPU power draw and per-region display names.
//!
//! The tables are built once on first access (`#[dynamic]`) and shared
//! read-only for the lifetime of the process.

use std::collections::HashMap;

use static_init::dynamic;

use super::model::{HardwareSpecs, ModelInfo, RegionInfo};

/// Power draw assumed for a GPU model missing from the table, in watts.
pub const DEFAULT_TDP_WATTS: f64 = 300.0;
/// Electricity price assumed for a region missing from the table, USD per kWh.
pub const DEFAULT_POWER_COST_KWH: f64 = 0.12;

/// Hardware profile of one instance type.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub vcpu: u32,
    pub ram_gb: u32,
    pub network: &'static str,
    pub storage_gb: Option<u32>,
    pub gpu_count: u32,
    pub gpu_model: &'static str,
}

impl InstanceSpec {
    /// Hardware fields as carried on an enriched offer.
    pub fn to_specs(&self) -> HardwareSpecs {
        HardwareSpecs {
            vcpu_count: Some(self.vcpu),
            ram_gb: Some(self.ram_gb),
            network_performance: Some(self.network.to_string()),
            storage_gb: self.storage_gb,
        }
    }
}

/// # Reference Tables
///
/// Pure data, no behaviour beyond lookups with documented defaults.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    pub instances: HashMap<String, InstanceSpec>,
    pub region_power_cost: HashMap<String, f64>,
    pub gpu_tdp_watts: HashMap<String, f64>,
    pub region_names: HashMap<String, String>,
    pub datacenter_models: Vec<String>,
}

#[dynamic]
static BUILTIN: ReferenceTables = ReferenceTables::builtin();

impl ReferenceTables {
    /// Shared instance of the built-in tables.
    pub fn shared() -> &'static ReferenceTables {
        &*BUILTIN
    }

    /// Hardware specs for an exact instance identifier.
    pub fn instance(&self, instance_type: &str) -> Option<&InstanceSpec> {
        self.instances.get(instance_type)
    }

    /// Power draw of `model` in watts, `DEFAULT_TDP_WATTS` when unknown.
    pub fn tdp_watts(&self, model: &str) -> f64 {
        self.gpu_tdp_watts.get(model).copied().unwrap_or(DEFAULT_TDP_WATTS)
    }

    /// Electricity price in `region`, `DEFAULT_POWER_COST_KWH` when unknown.
    pub fn power_cost_kwh(&self, region: &str) -> f64 {
        self.region_power_cost
            .get(region)
            .copied()
            .unwrap_or(DEFAULT_POWER_COST_KWH)
    }

    /// Human-readable region name, falling back to the code itself.
    pub fn region_name<'a>(&'a self, code: &'a str) -> &'a str {
        self.region_names.get(code).map(String::as_str).unwrap_or(code)
    }

    /// `datacenter` or `consumer`.
    pub fn model_category(&self, model: &str) -> &'static str {
        if self.datacenter_models.iter().any(|m| m == model) {
            "datacenter"
        } else {
            "consumer"
        }
    }

    /// Region list used when the auxiliary endpoint is unreachable.
    pub fn fallback_regions(&self) -> Vec<RegionInfo> {
        ["ap-southeast-1", "eu-west-1", "us-east-1", "us-east-2", "us-west-2"]
            .iter()
            .map(|code| RegionInfo {
                code: code.to_string(),
                name: self.region_name(code).to_string(),
                available: true,
            })
            .collect()
    }

    /// Model list used when the auxiliary endpoint is unreachable.
    pub fn fallback_models(&self) -> Vec<ModelInfo> {
        ["A10G", "A100", "A40", "H100", "RTX 4090", "T4", "V100"]
            .iter()
            .map(|name| ModelInfo {
                name: name.to_string(),
                available: true,
                category: Some(self.model_category(name).to_string()),
            })
            .collect()
    }

    /// The tables shipped with the engine.
    pub fn builtin() -> Self {
        let mut instances = HashMap::new();
        let mut add = |name: &str,
                       vcpu: u32,
                       ram_gb: u32,
                       network: &'static str,
                       storage_gb: Option<u32>,
                       gpu_count: u32,
                       gpu_model: &'static str| {
            instances.insert(
                name.to_string(),
                InstanceSpec { vcpu, ram_gb, network, storage_gb, gpu_count, gpu_model },
            );
        };

        // G4dn / T4
        add("g4dn.xlarge", 4, 16, "Up to 25 Gbps", Some(125), 1, "T4");
        add("g4dn.2xlarge", 8, 32, "Up to 25 Gbps", Some(225), 1, "T4");
        add("g4dn.4xlarge", 16, 64, "Up to 25 Gbps", Some(225), 1, "T4");
        add("g4dn.8xlarge", 32, 128, "50 Gbps", Some(900), 1, "T4");
        add("g4dn.12xlarge", 48, 192, "50 Gbps", Some(900), 4, "T4");
        add("g4dn.16xlarge", 64, 256, "50 Gbps", Some(900), 1, "T4");
        // G5 / A10G
        add("g5.xlarge", 4, 16, "Up to 10 Gbps", Some(250), 1, "A10G");
        add("g5.2xlarge", 8, 32, "Up to 10 Gbps", Some(450), 1, "A10G");
        add("g5.4xlarge", 16, 64, "Up to 25 Gbps", Some(600), 1, "A10G");
        add("g5.8xlarge", 32, 128, "25 Gbps", Some(900), 1, "A10G");
        add("g5.12xlarge", 48, 192, "40 Gbps", Some(3800), 4, "A10G");
        add("g5.16xlarge", 64, 256, "25 Gbps", Some(1900), 1, "A10G");
        add("g5.24xlarge", 96, 384, "50 Gbps", Some(3800), 4, "A10G");
        add("g5.48xlarge", 192, 768, "100 Gbps", Some(7600), 8, "A10G");
        // P3 / V100 (EBS only, no instance storage)
        add("p3.2xlarge", 8, 61, "Up to 10 Gbps", None, 1, "V100");
        add("p3.8xlarge", 32, 244, "10 Gbps", None, 4, "V100");
        add("p3.16xlarge", 64, 488, "25 Gbps", None, 8, "V100");
        add("p3dn.24xlarge", 96, 768, "100 Gbps", Some(1800), 8, "V100");
        // P4 / A100
        add("p4d.24xlarge", 96, 1152, "400 Gbps", Some(8000), 8, "A100");
        add("p4de.24xlarge", 96, 1152, "400 Gbps", Some(8000), 8, "A100");
        // P5 / H100
        add("p5.48xlarge", 192, 2048, "3200 Gbps", Some(30720), 8, "H100");

        let region_power_cost = [
            ("us-east-1", 0.10),
            ("us-east-2", 0.09),
            ("us-west-1", 0.15),
            ("us-west-2", 0.07),
            ("eu-west-1", 0.18),
            ("eu-central-1", 0.22),
            ("ap-southeast-1", 0.14),
            ("ap-northeast-1", 0.17),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let gpu_tdp_watts = [
            ("T4", 70.0),
            ("L4", 72.0),
            ("A10G", 150.0),
            ("V100", 300.0),
            ("A40", 300.0),
            ("A100", 400.0),
            ("H100", 700.0),
            ("K80", 300.0),
            ("M60", 300.0),
            ("RTX 4090", 450.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let region_names = [
            ("us-east-1", "US East (N. Virginia)"),
            ("us-east-2", "US East (Ohio)"),
            ("us-west-1", "US West (N. California)"),
            ("us-west-2", "US West (Oregon)"),
            ("eu-west-1", "EU West (Ireland)"),
            ("eu-central-1", "EU Central (Frankfurt)"),
            ("ap-southeast-1", "Asia Pacific (Singapore)"),
            ("ap-northeast-1", "Asia Pacific (Tokyo)"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let datacenter_models = ["A100", "V100", "H100", "A10G", "A40", "A30", "T4", "L4"]
            .into_iter()
            .map(String::from)
            .collect();

        Self {
            instances,
            region_power_cost,
            gpu_tdp_watts,
            region_names,
            datacenter_models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_fall_back_to_defaults() {
        let t = ReferenceTables::shared();
        assert_eq!(t.tdp_watts("A100"), 400.0);
        assert_eq!(t.tdp_watts("MI300X"), DEFAULT_TDP_WATTS);
        assert_eq!(t.power_cost_kwh("us-east-1"), 0.10);
        assert_eq!(t.power_cost_kwh("sa-east-1"), DEFAULT_POWER_COST_KWH);
        assert_eq!(t.region_name("eu-west-1"), "EU West (Ireland)");
        assert_eq!(t.region_name("xx-nowhere-9"), "xx-nowhere-9");
    }

    #[test]
    fn instance_specs_are_exact_match() {
        let t = ReferenceTables::shared();
        let spec = t.instance("p4d.24xlarge").unwrap();
        assert_eq!(spec.vcpu, 96);
        assert_eq!(spec.gpu_model, "A100");
        assert!(t.instance("P4D.24XLARGE").is_none());
        assert_eq!(t.instance("p3.2xlarge").unwrap().to_specs().storage_gb, None);
    }

    #[test]
    fn fallback_catalog_is_categorised() {
        let t = ReferenceTables::shared();
        let models = t.fallback_models();
        let rtx = models.iter().find(|m| m.name == "RTX 4090").unwrap();
        assert_eq!(rtx.category.as_deref(), Some("consumer"));
        assert!(t.fallback_regions().iter().all(|r| r.available));
    }
}
