#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the versions of the `ResourceGraphDefinition` CRD.

pub mod v1alpha1;

/// GROUP is the kubernetes API group.
pub static GROUP: &str = "kro.run";

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{CustomResourceExt, Resource};

    #[test]
    fn dummy() {
        println!("name = {}", v1alpha1::ResourceGraphDefinition::crd_name());
        println!("kind = {}", v1alpha1::ResourceGraphDefinition::kind(&()));
        assert_eq!(GROUP, "kro.run");
    }
}
