use annals_core::{
    event::EventSet,
    projection::{ProjectionError, ProjectionFailure},
};

use super::Store;
use crate::Error;

impl<E: EventSet> Store<E> {
    /// Re-derive one projection from the full log.
    ///
    /// In a single transaction the projection is loaded, every persisted view
    /// is wiped, every event is replayed in commit order and the result is
    /// saved. On failure nothing changes. Returns the number of events
    /// replayed.
    ///
    /// This reads the whole log and can take a while; callers needing a
    /// deadline should wrap it in their own timeout. Abandoning the future
    /// rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] for an unknown name and
    /// [`Error::Projection`] if the projection fails on any event.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self, name: &str) -> Result<u64, Error> {
        let mut projections = self.projections.lock().await;
        let projection = projections
            .get_mut(name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_owned()))?;
        let failed = |source| ProjectionFailure::new(name, source);

        let mut tx = self.begin_write().await?;
        projection.load(&mut tx).await.map_err(failed)?;
        projection.wipe(&mut tx).await.map_err(failed)?;

        let mut after = 0;
        let mut replayed = 0u64;
        loop {
            let page = self.page_after(&mut tx, after, self.batch_size).await?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = *last;
            let full = page.len() == self.batch_size as usize;

            for (_, descriptor) in &page {
                projection.project(&mut tx, descriptor).await.map_err(failed)?;
                replayed += 1;
            }
            if !full {
                break;
            }
        }

        projection.save(&mut tx).await.map_err(failed)?;
        tx.commit().await?;

        tracing::debug!(events = replayed, "projection rebuilt");
        Ok(replayed)
    }

    /// Rebuild every registered projection, in registration order, each in
    /// its own transaction. Returns the events replayed per projection.
    ///
    /// # Errors
    ///
    /// Stops at the first projection that fails; projections rebuilt before
    /// it stay rebuilt.
    pub async fn rebuild_all(&self) -> Result<Vec<(String, u64)>, Error> {
        let mut rebuilt = Vec::new();
        for name in self.projections().await {
            let replayed = self.rebuild(&name).await?;
            rebuilt.push((name, replayed));
        }
        Ok(rebuilt)
    }
}
