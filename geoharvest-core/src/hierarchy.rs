use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::records::GeonameRecord;

/// `(country, admin1..admin4)`; levels the admin record leaves empty stay
/// absent in its key.
type AdminKey = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// Names of one country's administrative areas, indexed by admin code path.
#[derive(Debug, Default)]
pub struct AdminHierarchy {
    names: HashMap<AdminKey, String>,
}

impl AdminHierarchy {
    pub fn from_admins(admins: &[GeonameRecord]) -> Self {
        let names = admins
            .iter()
            .map(|record| {
                (
                    (
                        record.country_code.clone(),
                        record.admin1.clone(),
                        record.admin2.clone(),
                        record.admin3.clone(),
                        record.admin4.clone(),
                    ),
                    record.name.clone(),
                )
            })
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn name_at(&self, country: &str, levels: [Option<&str>; 4]) -> Option<String> {
        let key = (
            country.to_owned(),
            levels[0].map(str::to_owned),
            levels[1].map(str::to_owned),
            levels[2].map(str::to_owned),
            levels[3].map(str::to_owned),
        );
        self.names.get(&key).cloned()
    }

    /// Fill in the admin text fields of a populated place by progressively
    /// extending the code path. A missing admin code short-circuits the
    /// remaining levels to absent.
    pub fn resolve(&self, record: &mut GeonameRecord) {
        let country = record.country_code.clone();
        let Some(a1) = record.admin1.clone() else {
            return;
        };
        record.admin1_txt = self.name_at(&country, [Some(&a1), None, None, None]);
        let Some(a2) = record.admin2.clone() else {
            return;
        };
        record.admin2_txt = self.name_at(&country, [Some(&a1), Some(&a2), None, None]);
        let Some(a3) = record.admin3.clone() else {
            return;
        };
        record.admin3_txt = self.name_at(&country, [Some(&a1), Some(&a2), Some(&a3), None]);
        let Some(a4) = record.admin4.clone() else {
            return;
        };
        record.admin4_txt = self.name_at(&country, [Some(&a1), Some(&a2), Some(&a3), Some(&a4)]);
    }
}

struct NameLookup {
    record: GeonameRecord,
    reply: oneshot::Sender<GeonameRecord>,
}

/// Handle to the per-country name-lookup service.
///
/// The service is a serial mailbox task owning the hierarchy for exactly
/// one country; dropping the last handle tears it down. The handle is the
/// only way to reach it, there is no name registry.
#[derive(Clone)]
pub struct HierarchyService {
    mailbox: mpsc::Sender<NameLookup>,
}

impl HierarchyService {
    pub fn spawn(hierarchy: AdminHierarchy) -> Self {
        let (mailbox, mut requests) = mpsc::channel::<NameLookup>(64);
        tokio::spawn(async move {
            while let Some(NameLookup { mut record, reply }) = requests.recv().await {
                hierarchy.resolve(&mut record);
                // receiver may have given up; nothing to do then
                let _ = reply.send(record);
            }
        });
        Self { mailbox }
    }

    async fn name_lookup(&self, record: GeonameRecord) -> Option<oneshot::Receiver<GeonameRecord>> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(NameLookup { record, reply })
            .await
            .ok()?;
        Some(response)
    }
}

/// Join every populated place against the hierarchy service.
///
/// One lookup is dispatched per record and exactly that many replies are
/// collected; replies are not correlated, so output order may differ from
/// input order. A reply that never arrives shrinks the output, and the
/// delta is logged.
pub async fn enrich(service: &HierarchyService, populated: Vec<GeonameRecord>) -> Vec<GeonameRecord> {
    let total = populated.len();

    let mut pending = Vec::with_capacity(total);
    for record in populated {
        if let Some(response) = service.name_lookup(record).await {
            pending.push(response);
        }
    }

    let enriched: Vec<GeonameRecord> = futures::future::join_all(pending)
        .await
        .into_iter()
        .filter_map(Result::ok)
        .collect();

    if enriched.len() != total {
        tracing::warn!(
            requested = total,
            resolved = enriched.len(),
            "dropped {} populated places during enrichment",
            total - enriched.len()
        );
    }
    enriched
}
