use crate::errors::*;
use async_trait::async_trait;
use oci_distribution::client::{Certificate, CertificateEncoding, Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment variable prefix for registry credential discovery,
/// e.g. `KBLD_REGISTRY_HOSTNAME_0` / `KBLD_REGISTRY_USERNAME_0` / `KBLD_REGISTRY_PASSWORD_0`.
pub const ENV_AUTH_PREFIX: &str = "KBLD_REGISTRY";

/// An image reference split into its repository, tag and digest parts.
/// The repository is kept verbatim so rewritten documents preserve whatever
/// form the user wrote (`nginx`, not `docker.io/library/nginx`).
#[derive(Debug, PartialEq, Clone)]
pub struct ImageRef {
    pub repo: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((repo, digest)) = s.split_once('@') {
            Ok(ImageRef {
                repo: repo.to_string(),
                tag: None,
                digest: Some(digest.to_string()),
            })
        } else if let Some((repo, tag)) = s.rsplit_once(':').filter(|(_, tag)| !tag.contains('/')) {
            // a colon followed by a slash is a registry port, not a tag
            Ok(ImageRef {
                repo: repo.to_string(),
                tag: Some(tag.to_string()),
                digest: None,
            })
        } else {
            Ok(ImageRef {
                repo: s.to_string(),
                tag: None,
                digest: None,
            })
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(digest) = &self.digest {
            write!(f, "{}@{digest}", self.repo)
        } else if let Some(tag) = &self.tag {
            write!(f, "{}:{tag}", self.repo)
        } else {
            write!(f, "{}", self.repo)
        }
    }
}

impl ImageRef {
    /// Digest-qualified form of this reference, dropping any tag.
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}@{digest}", self.repo)
    }
}

/// Registry lookups the resolution pipeline depends on. The production
/// implementation is [`Registry`]; tests substitute their own.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Resolves a remote reference to its manifest digest.
    async fn digest(&self, url: &str) -> Result<String>;

    /// Lists the tags of the repository the reference points into.
    async fn list_tags(&self, url: &str) -> Result<Vec<String>>;

    /// Probes a list of references and returns the first that exists.
    async fn first_image_exists(&self, urls: &[String]) -> Result<String> {
        for url in urls {
            if self.digest(url).await.is_ok() {
                return Ok(url.clone());
            }
        }
        bail!("Expected to find at least one of these images: {urls:?}");
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOpts {
    pub ca_cert_paths: Vec<PathBuf>,
    pub verify_certs: bool,
    pub insecure: bool,
}

/// HTTP-based OCI registry client.
pub struct Registry {
    client: Client,
    auths: Vec<EnvAuth>,
}

impl Registry {
    pub fn new(opts: &RegistryOpts) -> Result<Registry> {
        let mut extra_root_certificates = Vec::new();
        for path in &opts.ca_cert_paths {
            let data = std::fs::read(path)
                .with_context(|| anyhow!("Failed to read registry ca certificate: {path:?}"))?;
            extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data,
            });
        }

        let config = ClientConfig {
            protocol: if opts.insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: !opts.verify_certs,
            extra_root_certificates,
            ..Default::default()
        };

        Ok(Registry {
            client: Client::new(config),
            auths: EnvAuth::discover(ENV_AUTH_PREFIX, env::vars()),
        })
    }

    fn auth_for(&self, reference: &Reference) -> RegistryAuth {
        let registry = reference.resolve_registry();
        for auth in &self.auths {
            if auth.hostname == registry {
                return RegistryAuth::Basic(auth.username.clone(), auth.password.clone());
            }
        }
        RegistryAuth::Anonymous
    }

    fn parse_reference(url: &str) -> Result<Reference> {
        Reference::try_from(url)
            .with_context(|| anyhow!("Failed to parse image reference: {url:?}"))
    }
}

#[async_trait]
impl ImageRegistry for Registry {
    async fn digest(&self, url: &str) -> Result<String> {
        let reference = Self::parse_reference(url)?;
        let auth = self.auth_for(&reference);
        debug!("Fetching manifest digest for {url:?}");
        let digest = self
            .client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .with_context(|| anyhow!("Failed to fetch manifest digest for {url:?}"))?;
        Ok(digest)
    }

    async fn list_tags(&self, url: &str) -> Result<Vec<String>> {
        let reference = Self::parse_reference(url)?;
        let auth = self.auth_for(&reference);
        debug!("Listing tags for {url:?}");
        let response = self
            .client
            .list_tags(&reference, &auth, None, None)
            .await
            .with_context(|| anyhow!("Failed to list tags for {url:?}"))?;
        Ok(response.tags)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EnvAuth {
    hostname: String,
    username: String,
    password: String,
}

impl EnvAuth {
    fn discover<I: Iterator<Item = (String, String)>>(prefix: &str, vars: I) -> Vec<EnvAuth> {
        let vars = vars.collect::<Vec<_>>();
        let hostname_prefix = format!("{prefix}_HOSTNAME");

        let mut auths = Vec::new();
        for (key, hostname) in &vars {
            let Some(suffix) = key.strip_prefix(&hostname_prefix) else {
                continue;
            };
            let lookup = |name: &str| {
                vars.iter()
                    .find(|(key, _)| *key == format!("{prefix}_{name}{suffix}"))
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default()
            };
            auths.push(EnvAuth {
                hostname: hostname.clone(),
                username: lookup("USERNAME"),
                password: lookup("PASSWORD"),
            });
        }
        auths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_ref() -> Result<()> {
        let image_ref = "nginx".parse::<ImageRef>()?;
        assert_eq!(
            image_ref,
            ImageRef {
                repo: "nginx".to_string(),
                tag: None,
                digest: None,
            }
        );
        Ok(())
    }

    #[test]
    fn test_parse_image_ref_tag() -> Result<()> {
        let image_ref = "nginx:1.19".parse::<ImageRef>()?;
        assert_eq!(
            image_ref,
            ImageRef {
                repo: "nginx".to_string(),
                tag: Some("1.19".to_string()),
                digest: None,
            }
        );
        Ok(())
    }

    #[test]
    fn test_parse_image_ref_digest() -> Result<()> {
        let image_ref = "nginx@sha256:bbb".parse::<ImageRef>()?;
        assert_eq!(
            image_ref,
            ImageRef {
                repo: "nginx".to_string(),
                tag: None,
                digest: Some("sha256:bbb".to_string()),
            }
        );
        Ok(())
    }

    #[test]
    fn test_parse_image_ref_registry_port() -> Result<()> {
        let image_ref = "registry:5000/myapp".parse::<ImageRef>()?;
        assert_eq!(
            image_ref,
            ImageRef {
                repo: "registry:5000/myapp".to_string(),
                tag: None,
                digest: None,
            }
        );

        let image_ref = "registry:5000/myapp:dev".parse::<ImageRef>()?;
        assert_eq!(image_ref.repo, "registry:5000/myapp");
        assert_eq!(image_ref.tag.as_deref(), Some("dev"));
        Ok(())
    }

    #[test]
    fn test_image_ref_round_trip() -> Result<()> {
        for url in ["nginx", "nginx:1.19", "nginx@sha256:bbb", "registry:5000/myapp:dev"] {
            assert_eq!(url.parse::<ImageRef>()?.to_string(), url);
        }
        Ok(())
    }

    #[test]
    fn test_image_ref_with_digest_drops_tag() -> Result<()> {
        let image_ref = "nginx:1.19".parse::<ImageRef>()?;
        assert_eq!(image_ref.with_digest("sha256:bbb"), "nginx@sha256:bbb");
        Ok(())
    }

    #[test]
    fn test_env_auth_discovery() {
        let vars = vec![
            ("KBLD_REGISTRY_HOSTNAME_0".to_string(), "registry.example.com".to_string()),
            ("KBLD_REGISTRY_USERNAME_0".to_string(), "user".to_string()),
            ("KBLD_REGISTRY_PASSWORD_0".to_string(), "pass".to_string()),
            ("KBLD_REGISTRY_HOSTNAME_1".to_string(), "other.example.com".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let mut auths = EnvAuth::discover(ENV_AUTH_PREFIX, vars.into_iter());
        auths.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        assert_eq!(
            auths,
            vec![
                EnvAuth {
                    hostname: "other.example.com".to_string(),
                    username: String::new(),
                    password: String::new(),
                },
                EnvAuth {
                    hostname: "registry.example.com".to_string(),
                    username: "user".to_string(),
                    password: "pass".to_string(),
                },
            ]
        );
    }
}
