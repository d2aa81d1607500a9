use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(StudentId);
id_newtype!(AttendanceId);

/// Opaque identifier of a physical tag. The collaborator emits these either as
/// strings or as bare numbers, so both are accepted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CardTag(String);

impl CardTag {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCardTag {
    Text(String),
    Number(i64),
}

impl<'de> Deserialize<'de> for CardTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = match RawCardTag::deserialize(deserializer)? {
            RawCardTag::Text(text) => text,
            RawCardTag::Number(number) => number.to_string(),
        };
        CardTag::new(raw).ok_or_else(|| de::Error::custom("card id must not be empty"))
    }
}

fn deserialize_optional_card<'de, D>(deserializer: D) -> Result<Option<CardTag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawCardTag>::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| match raw {
        RawCardTag::Text(text) => CardTag::new(text),
        RawCardTag::Number(number) => CardTag::new(number.to_string()),
    }))
}

/// Generates a closed set of form options. `parse` only accepts the listed
/// labels; decoding collaborator data keeps anything else as `Other`.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            /// A value stored by the collaborator that the form does not offer.
            Other(String),
        }

        impl $name {
            /// The options offered at registration.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn label(&self) -> &str {
                match self {
                    $($name::$variant => $label,)+
                    $name::Other(raw) => raw.as_str(),
                }
            }

            pub fn parse(raw: &str) -> Result<Self, ValidationError> {
                let raw = raw.trim();
                Self::ALL
                    .iter()
                    .find(|candidate| candidate.label().eq_ignore_ascii_case(raw))
                    .cloned()
                    .ok_or_else(|| ValidationError::UnknownOption {
                        field: $field,
                        value: raw.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.label())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.label())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Ok($name::parse(&raw).unwrap_or_else(|_| $name::Other(raw)))
            }
        }
    };
}

labelled_enum!(BloodGroup, "Blood_Group" {
    APositive => "A+",
    ANegative => "A-",
    BPositive => "B+",
    BNegative => "B-",
    OPositive => "O+",
    ONegative => "O-",
    AbPositive => "AB+",
    AbNegative => "AB-",
});

labelled_enum!(Department, "Dept" {
    AiDs => "AI&DS",
    AiMl => "AI&ML",
    Cse => "CSE",
    CyberSecurity => "CYBER SECURITY",
    It => "IT",
});

labelled_enum!(
    /// Four-year intake window a student belongs to.
    Batch, "Batch" {
        Y2021 => "2021-2025",
        Y2022 => "2022-2026",
        Y2023 => "2023-2027",
        Y2024 => "2024-2028",
    }
);

/// A registered student as returned by `GET /api/students`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Roll_No")]
    pub roll_no: String,
    #[serde(rename = "DOB", deserialize_with = "deserialize_date_of_birth")]
    pub date_of_birth: NaiveDate,
    #[serde(rename = "Blood_Group")]
    pub blood_group: BloodGroup,
    #[serde(rename = "Phone")]
    pub phone: String,
    #[serde(rename = "Dept")]
    pub department: Department,
    #[serde(rename = "Batch")]
    pub batch: Batch,
    #[serde(
        rename = "Card_Id",
        default,
        deserialize_with = "deserialize_optional_card",
        skip_serializing_if = "Option::is_none"
    )]
    pub card_id: Option<CardTag>,
}

impl Student {
    pub fn owns_card(&self, card: &CardTag) -> bool {
        self.card_id.as_ref() == Some(card)
    }
}

/// Finds the single student bound to `card`, if any.
pub fn student_for_card<'a>(roster: &'a [Student], card: &CardTag) -> Option<&'a Student> {
    roster.iter().find(|student| student.owns_card(card))
}

fn deserialize_date_of_birth<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_date_of_birth(&raw).ok_or_else(|| de::Error::custom(format!("invalid DOB: {raw}")))
}

/// Accepts `YYYY-MM-DD` as well as the RFC 2822 rendering some HTTP stacks
/// produce for date columns (`Tue, 02 Jul 2004 00:00:00 GMT`).
pub fn parse_date_of_birth(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc2822(raw)
                .ok()
                .map(|parsed| parsed.date_naive())
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|parsed| parsed.date_naive())
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    #[serde(alias = "Present")]
    Present,
    #[serde(alias = "Absent")]
    Absent,
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceStatus::Present => f.write_str("present"),
            AttendanceStatus::Absent => f.write_str("Absent"),
        }
    }
}

fn default_status() -> AttendanceStatus {
    AttendanceStatus::Present
}

/// An immutable attendance event, created by the collaborator on recognition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: AttendanceId,
    pub student_id: StudentId,
    pub student_name: String,
    #[serde(deserialize_with = "deserialize_instant")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: AttendanceStatus,
}

pub(crate) fn deserialize_instant<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_instant(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
}

/// Parses RFC 3339 instants and naive ISO date-times. Naive values carry no
/// offset and are read as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Raw registration input exactly as the operator typed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentForm {
    pub name: String,
    pub roll_no: String,
    pub date_of_birth: String,
    pub blood_group: String,
    pub phone: String,
    pub department: String,
    pub batch: String,
}

const MAX_NAME_LEN: usize = 20;
const MAX_ROLL_NO_LEN: usize = 10;
const PHONE_DIGITS: usize = 10;

impl StudentForm {
    /// Validates every field and reports all problems at once. The form is
    /// borrowed so the caller keeps its input for correction.
    pub fn validate(&self) -> Result<NewStudent, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let name = self.name.trim();
        if name.is_empty() {
            errors.push(ValidationError::Required { field: "Name" });
        } else if name.chars().count() > MAX_NAME_LEN {
            errors.push(ValidationError::TooLong {
                field: "Name",
                max: MAX_NAME_LEN,
            });
        }

        let roll_no = self.roll_no.trim();
        if roll_no.is_empty() {
            errors.push(ValidationError::Required { field: "Roll_No" });
        } else if roll_no.chars().count() > MAX_ROLL_NO_LEN {
            errors.push(ValidationError::TooLong {
                field: "Roll_No",
                max: MAX_ROLL_NO_LEN,
            });
        }

        let date_of_birth = match NaiveDate::parse_from_str(self.date_of_birth.trim(), "%Y-%m-%d")
        {
            Ok(date) => Some(date),
            Err(_) => {
                errors.push(ValidationError::InvalidDate {
                    field: "DOB",
                    value: self.date_of_birth.trim().to_string(),
                });
                None
            }
        };

        let phone = self.phone.trim();
        if phone.len() != PHONE_DIGITS || !phone.chars().all(|c| c.is_ascii_digit()) {
            errors.push(ValidationError::InvalidPhone {
                value: phone.to_string(),
            });
        }

        let blood_group = collect(BloodGroup::parse(&self.blood_group), &mut errors);
        let department = collect(Department::parse(&self.department), &mut errors);
        let batch = collect(Batch::parse(&self.batch), &mut errors);

        match (date_of_birth, blood_group, department, batch) {
            (Some(date_of_birth), Some(blood_group), Some(department), Some(batch))
                if errors.is_empty() =>
            {
                Ok(NewStudent {
                    name: name.to_string(),
                    roll_no: roll_no.to_string(),
                    date_of_birth,
                    blood_group,
                    phone: phone.to_string(),
                    department,
                    batch,
                })
            }
            _ => Err(errors),
        }
    }
}

fn collect<T>(result: Result<T, ValidationError>, errors: &mut Vec<ValidationError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            errors.push(err);
            None
        }
    }
}

/// A validated registration payload for `POST /api/students`. It has no card:
/// tags are only ever bound through the capture workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewStudent {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Roll_No")]
    pub roll_no: String,
    #[serde(rename = "DOB", serialize_with = "serialize_iso_date")]
    pub date_of_birth: NaiveDate,
    #[serde(rename = "Blood_Group")]
    pub blood_group: BloodGroup,
    #[serde(rename = "Phone")]
    pub phone: String,
    #[serde(rename = "Dept")]
    pub department: Department,
    #[serde(rename = "Batch")]
    pub batch: Batch,
}

fn serialize_iso_date<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&date.format("%Y-%m-%d").to_string())
}
