//! Certificate authority and member certificates, generated on the
//! control node before anything is distributed.

use super::ops::{GenerateCa, GenerateCert};
use anyhow::Result;
use artifacts::{LocalCertificate, PlanningSession};
use execgraph::{ExecutionNode, Fragment, FragmentBuilder, Host, NodeId};

/// Certificates of one component: a CA and one certificate per member.
#[derive(Debug, Clone)]
pub struct Pki {
    component: String,
    ca: LocalCertificate,
}

impl Pki {
    pub fn new(session: &PlanningSession, component: &str) -> Self {
        Self {
            component: component.to_string(),
            ca: LocalCertificate::new(session, component, "ca"),
        }
    }

    pub fn ca(&self) -> &LocalCertificate {
        &self.ca
    }

    /// Certificate of one member host.
    pub fn member(&self, session: &PlanningSession, host: &Host) -> LocalCertificate {
        LocalCertificate::new(session, &self.component, &format!("member-{}", host.name))
    }

    /// Generation nodes for whatever is missing.
    ///
    /// A new CA invalidates every member certificate, so all of them are
    /// reissued after it.
    pub fn plan(&self, session: &PlanningSession, members: &[Host]) -> Result<Fragment> {
        let control = session.control();
        let mut builder = FragmentBuilder::new();

        let ca_id = NodeId::derive("ca", self.ca.cert_path().display());
        let regenerate = !self.ca.present(session)?;
        if regenerate {
            log::debug!("No {} CA, generating one", self.component);
            builder.add(
                ca_id.clone(),
                ExecutionNode::new(
                    format!("generate {} CA", self.component),
                    GenerateCa {
                        cert: self.ca.cert_path().to_path_buf(),
                        key: self.ca.key_path().to_path_buf(),
                        common_name: format!("{}-ca", self.component),
                    },
                    [control.clone()],
                ),
            )?;
        }

        for host in members {
            let cert = self.member(session, host);
            if !regenerate && cert.present(session)? {
                continue;
            }
            let mut node = ExecutionNode::new(
                format!("issue {} certificate for {}", self.component, host),
                GenerateCert {
                    ca_cert: self.ca.cert_path().to_path_buf(),
                    ca_key: self.ca.key_path().to_path_buf(),
                    cert: cert.cert_path().to_path_buf(),
                    key: cert.key_path().to_path_buf(),
                    common_name: host.name.clone(),
                    sans: subject_names(host),
                    force: regenerate,
                },
                [control.clone()],
            );
            if regenerate {
                node = node.depends_on([ca_id.clone()]);
            }
            builder.add(NodeId::derive("cert", cert.cert_path().display()), node)?;
        }

        Ok(builder.build()?)
    }
}

/// Names a member certificate is valid for.
fn subject_names(host: &Host) -> Vec<String> {
    let mut names = vec![host.name.clone(), host.address.clone()];
    for extra in ["127.0.0.1", "localhost"] {
        if !names.iter().any(|n| n == extra) {
            names.push(extra.to_string());
        }
    }
    names
}
