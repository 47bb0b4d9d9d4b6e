use kube::core::CustomResourceExt;
use vault_unseal_operator::crds::unseal_config::VaultUnsealConfig;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&VaultUnsealConfig::crd())?);
    Ok(())
}
