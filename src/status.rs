//! Closed status/type sets and their transition tables.
//!
//! Every lifecycle field is a tagged enum with a declarative allowed-edges
//! table; `can_transition_to` is a pure membership check with no side
//! effects. Serialized form is the snake_case value; `label` is the human
//! form shown next to it at the JSON boundary.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentPeriodStatus {
    Open,
    Closing,
    Closed,
}

impl AssessmentPeriodStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn allowed_next(self) -> &'static [AssessmentPeriodStatus] {
        match self {
            Self::Open => &[Self::Closing],
            Self::Closing => &[Self::Open, Self::Closed],
            Self::Closed => &[],
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingStatus {
    Pending,
    InValidation,
    Approved,
    Closed,
}

impl ClosingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InValidation => "in_validation",
            Self::Approved => "approved",
            Self::Closed => "closed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InValidation => "In Validation",
            Self::Approved => "Approved",
            Self::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_validation" => Some(Self::InValidation),
            "approved" => Some(Self::Approved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn allowed_next(self) -> &'static [ClosingStatus] {
        match self {
            Self::Pending => &[Self::InValidation],
            Self::InValidation => &[Self::Pending, Self::Approved],
            Self::Approved => &[Self::Closed],
            Self::Closed => &[],
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcademicYearStatus {
    Planning,
    Active,
    Closing,
    Closed,
}

impl AcademicYearStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Planning => "Planning",
            Self::Active => "Active",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(Self::Planning),
            "active" => Some(Self::Active),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Forward walk of the year lattice. `Closed` is absent on purpose:
    /// a year reaches it only through the closure gate.
    pub fn allowed_next(self) -> &'static [AcademicYearStatus] {
        match self {
            Self::Planning => &[Self::Active],
            Self::Active => &[Self::Closing],
            Self::Closing => &[],
            Self::Closed => &[],
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    JustifiedAbsence,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::JustifiedAbsence => "justified_absence",
            Self::Excused => "excused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "justified_absence" => Some(Self::JustifiedAbsence),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    /// Everything except a plain absence counts toward frequency.
    pub fn counts_as_present(self) -> bool {
        !matches!(self, Self::Absent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    Bimestral,
    Trimestral,
    Semestral,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bimestral => "bimestral",
            Self::Trimestral => "trimestral",
            Self::Semestral => "semestral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bimestral" => Some(Self::Bimestral),
            "trimestral" => Some(Self::Trimestral),
            "semestral" => Some(Self::Semestral),
            _ => None,
        }
    }

    pub fn max_number(self) -> i64 {
        match self {
            Self::Bimestral => 4,
            Self::Trimestral => 3,
            Self::Semestral => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalResult {
    Approved,
    Retained,
    PartialProgression,
    Transferred,
    Abandoned,
}

impl FinalResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Retained => "retained",
            Self::PartialProgression => "partial_progression",
            Self::Transferred => "transferred",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Approved => "Approved",
            Self::Retained => "Retained",
            Self::PartialProgression => "Partial Progression",
            Self::Transferred => "Transferred",
            Self::Abandoned => "Abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "retained" => Some(Self::Retained),
            "partial_progression" => Some(Self::PartialProgression),
            "transferred" => Some(Self::Transferred),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AverageFormula {
    Arithmetic,
    Weighted,
}

impl AverageFormula {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arithmetic => "arithmetic",
            Self::Weighted => "weighted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arithmetic" => Some(Self::Arithmetic),
            "weighted" => Some(Self::Weighted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReplaces {
    Higher,
    Average,
    Last,
}

impl RecoveryReplaces {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Higher => "higher",
            Self::Average => "average",
            Self::Last => "last",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "higher" => Some(Self::Higher),
            "average" => Some(Self::Average),
            "last" => Some(Self::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeType {
    Numeric,
    Conceptual,
}

impl GradeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Conceptual => "conceptual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "numeric" => Some(Self::Numeric),
            "conceptual" => Some(Self::Conceptual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectificationStatus {
    Requested,
    Approved,
    Rejected,
}

impl RectificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_decided(self) -> bool {
        !matches!(self, Self::Requested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Active,
    Transferred,
    Abandoned,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Transferred => "transferred",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "transferred" => Some(Self::Transferred),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}
