//! Manifests writes the derived `ResourceGraphDefinition` CRD YAML to `config/crd`, for local
//! `kubectl apply` during development.

use std::{fs::File, path::Path};

use kube::{CustomResourceExt, Resource};

use crate::{CONFIG_DIR, Result, rel};
use api::v1alpha1::ResourceGraphDefinition;

pub fn command() -> Result<()> {
    let out = CONFIG_DIR.join("crd");
    std::fs::create_dir_all(&out)?;
    write_crd::<ResourceGraphDefinition, _>(&out)?;
    Ok(())
}

fn write_crd<K, P>(out_dir: P) -> Result<()>
where
    K: Resource<DynamicType = ()> + CustomResourceExt,
    P: AsRef<Path>,
{
    let doc = serde_json::to_value(K::crd())?;
    let out = out_dir.as_ref().join(format!("{}.yaml", K::crd_name()));
    let w = File::create(&out)?;
    serde_yaml::to_writer(&w, &doc)?;
    eprintln!("# wrote: {}", rel(&out));
    Ok(())
}
