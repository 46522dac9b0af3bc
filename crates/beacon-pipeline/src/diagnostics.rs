use crate::error::UploadError;

/// What started an upload attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadTrigger {
    Scheduled,
    Flush,
}

impl UploadTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Flush => "flush",
        }
    }
}

/// One upload outcome, as seen by a [`DiagnosticsListener`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReport {
    pub trigger: UploadTrigger,
    pub delivered: usize,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
}

impl UploadReport {
    pub fn from_result(trigger: UploadTrigger, result: &Result<usize, UploadError>) -> Self {
        match result {
            Ok(delivered) => Self {
                trigger,
                delivered: *delivered,
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                trigger,
                delivered: 0,
                error: Some(e.to_string()),
                error_kind: Some(e.error_kind()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Host callback for upload outcomes. Called on a runtime worker; keep it cheap.
pub trait DiagnosticsListener: Send + Sync {
    fn on_upload(&self, report: &UploadReport);
}

impl<F> DiagnosticsListener for F
where
    F: Fn(&UploadReport) + Send + Sync,
{
    fn on_upload(&self, report: &UploadReport) {
        self(report)
    }
}
