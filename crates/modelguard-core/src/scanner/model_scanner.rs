use std::{
    path::Path,
    sync::{atomic::Ordering, Arc},
};

use tracing::{debug, info, instrument, trace, warn};

use super::{FallbackScanner, ScanError, ScanProgress, ScanReport, Scanner, ScannerKind};
use crate::{
    classify::Classifier,
    model::{extractor_for, GraphExtractor, ModelHandle},
    settings::ScanSettings,
};

/// Scan orchestrator: sniff the format, walk the structure of formats we
/// understand, delegate everything else to the fallback collaborator.
pub struct ModelScanner {
    fallback: Arc<dyn FallbackScanner>,
    classifier: Classifier,
}

impl ModelScanner {
    pub fn new(fallback: Arc<dyn FallbackScanner>) -> Self {
        Self::with_settings(fallback, &ScanSettings::default())
    }

    pub fn with_settings(fallback: Arc<dyn FallbackScanner>, settings: &ScanSettings) -> Self {
        Self {
            fallback,
            classifier: Classifier::new(settings.max_details_chars),
        }
    }

    fn scan_structure(
        &self,
        handle: &ModelHandle,
        extractor: &dyn GraphExtractor,
        progress: &ScanProgress,
    ) -> Result<ScanReport, ScanError> {
        let records = extractor.extract(handle, progress)?;
        progress
            .total_records
            .store(records.len(), Ordering::Relaxed);

        let mut issues = Vec::new();
        let mut scanned = 0usize;
        for record in records {
            if progress.is_cancelled() {
                warn!(scanned, "scan cancelled");
                return Err(ScanError::Cancelled);
            }
            let found = self.classifier.classify(&record);
            if !found.is_empty() {
                trace!(
                    name = %record.name,
                    op_type = %record.op_type,
                    count = found.len(),
                    "record flagged"
                );
            }
            progress
                .issues_found
                .fetch_add(found.len(), Ordering::Relaxed);
            issues.extend(found);
            scanned += 1;
            progress.processed_records.fetch_add(1, Ordering::Relaxed);
        }

        Ok(ScanReport::new(
            handle.path(),
            handle.format(),
            ScannerKind::Builtin,
            scanned,
            issues,
        ))
    }

    fn delegate(
        &self,
        handle: &ModelHandle,
        progress: &ScanProgress,
    ) -> Result<ScanReport, ScanError> {
        if progress.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        debug!(path = %handle.path().display(), "delegating to fallback scanner");
        let findings = self
            .fallback
            .scan(handle.path())
            .map_err(|err| ScanError::Fallback {
                reason: format!("{err:#}"),
            })?;

        let issues: Vec<_> = findings.into_iter().map(|f| f.into_issue()).collect();
        progress
            .issues_found
            .store(issues.len(), Ordering::Relaxed);
        Ok(ScanReport::new(
            handle.path(),
            handle.format(),
            ScannerKind::Fallback,
            0,
            issues,
        ))
    }
}

impl Scanner for ModelScanner {
    #[instrument(name = "scan_model", skip(self, progress), fields(path = %path.display()))]
    fn scan_with_progress(
        &self,
        path: &Path,
        progress: &ScanProgress,
    ) -> Result<ScanReport, ScanError> {
        let handle = ModelHandle::detect(path)?;
        let report = match extractor_for(handle.format()) {
            Some(extractor) => self.scan_structure(&handle, extractor, progress)?,
            None => self.delegate(&handle, progress)?,
        };
        info!(
            format = %report.format,
            scanner = %report.scanner,
            records = report.records_scanned,
            issues = report.issues.len(),
            "scan completed"
        );
        Ok(report)
    }
}
