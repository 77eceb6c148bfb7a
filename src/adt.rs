//! ADT^A01 (patient admission) on top of the generic model.
//!
//! [`PatientAdmission`] carries the values an admitting system fills in and
//! turns them into a [`Message`]; [`AdmissionSummary`] reads the same values
//! back off a decoded message.

use crate::{Delimiters, Field, FieldPath, HL7Error, Message, MessageBuilder};
use serde::{Deserialize, Serialize};

// PV1 positions as emitted by the admitting system.
const PV1_ADMISSION_TYPE: usize = 47;
const PV1_VIP_INDICATOR: usize = 49;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedValue {
    pub identifier: String,
    pub text: String,
    pub coding_system: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub point_of_care: String,
    pub room: String,
    pub facility: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: String,
    pub family_name: String,
    pub given_name: String,
    pub identifier_type: String,
}

/// Everything needed to emit an ADT^A01.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientAdmission {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    /// HL7 timestamp used for MSH-7 and EVN-2.
    pub timestamp: String,
    pub control_id: String,
    pub processing_id: String,
    pub version: String,

    pub patient_id: String,
    pub assigning_authority: String,
    pub family_name: String,
    pub given_name: String,
    pub date_of_birth: String,
    pub sex: String,
    pub race: CodedValue,
    pub address: Address,

    pub set_id: String,
    pub patient_class: String,
    pub location: Location,
    pub attending_doctor: Doctor,
    pub admission_type: String,
    pub vip_indicator: String,
}

impl PatientAdmission {
    /// Build the MSH, EVN, PID and PV1 segments of an ADT^A01.
    pub fn to_message(&self, delimiters: Delimiters) -> Result<Message, HL7Error> {
        let doctor = &self.attending_doctor;
        MessageBuilder::new(delimiters)
            .field("MSH", 3, self.sending_application.as_str())
            .field("MSH", 4, self.sending_facility.as_str())
            .field("MSH", 5, self.receiving_application.as_str())
            .field("MSH", 6, self.receiving_facility.as_str())
            .field("MSH", 7, self.timestamp.as_str())
            .field("MSH", 9, Field::from_components(["ADT", "A01", "ADT_A01"]))
            .field("MSH", 10, self.control_id.as_str())
            .field("MSH", 11, self.processing_id.as_str())
            .field("MSH", 12, self.version.as_str())
            .field("EVN", 1, "A01")
            .field("EVN", 2, self.timestamp.as_str())
            .field(
                "PID",
                3,
                Field::from_components([
                    self.patient_id.as_str(),
                    "",
                    "",
                    self.assigning_authority.as_str(),
                ]),
            )
            .field(
                "PID",
                5,
                Field::from_components([self.family_name.as_str(), self.given_name.as_str()]),
            )
            .field("PID", 7, self.date_of_birth.as_str())
            .field("PID", 8, self.sex.as_str())
            .field(
                "PID",
                10,
                Field::from_components([
                    self.race.identifier.as_str(),
                    self.race.text.as_str(),
                    self.race.coding_system.as_str(),
                ]),
            )
            .field(
                "PID",
                11,
                Field::from_components([
                    self.address.street.as_str(),
                    "",
                    self.address.city.as_str(),
                    self.address.state.as_str(),
                    self.address.zip.as_str(),
                    self.address.country.as_str(),
                ]),
            )
            .field("PV1", 1, self.set_id.as_str())
            .field("PV1", 2, self.patient_class.as_str())
            .field(
                "PV1",
                3,
                Field::from_components([
                    "",
                    self.location.point_of_care.as_str(),
                    self.location.room.as_str(),
                    self.location.facility.as_str(),
                ]),
            )
            .field(
                "PV1",
                7,
                Field::from_components([
                    doctor.id.as_str(),
                    doctor.family_name.as_str(),
                    doctor.given_name.as_str(),
                    "",
                    "",
                    "",
                    "",
                    "",
                    doctor.identifier_type.as_str(),
                ]),
            )
            .field("PV1", PV1_ADMISSION_TYPE, self.admission_type.as_str())
            .field("PV1", PV1_VIP_INDICATOR, self.vip_indicator.as_str())
            .build()
    }
}

/// The values a receiving system shows for an admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSummary {
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub receiving_application: Option<String>,
    pub receiving_facility: Option<String>,
    pub message_type: String,
    pub control_id: Option<String>,
    pub version: Option<String>,

    pub event_type: Option<String>,
    pub recorded_at: Option<String>,

    pub patient_id: String,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub sex: Option<String>,
    pub race: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,

    pub set_id: Option<String>,
    pub patient_class: Option<String>,
    pub point_of_care: Option<String>,
    pub attending_doctor: Option<String>,
}

fn text(message: &Message, path: FieldPath) -> Option<String> {
    message
        .get(&path)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl AdmissionSummary {
    pub fn from_hl7(message: &Message) -> Result<Self, HL7Error> {
        if !message.is_adt() {
            return Err(HL7Error::InvalidStructure(
                "Not an ADT message".to_string()
            ));
        }

        // Extract message type (e.g., ADT^A01)
        let message_type = match message.trigger_event() {
            Some(trigger) => format!("ADT^{}", trigger),
            None => "ADT".to_string(),
        };

        message
            .get_segment("PID")
            .ok_or_else(|| HL7Error::MissingField("PID segment".to_string()))?;
        let patient_id = text(message, FieldPath::new("PID", 3).component(1))
            .ok_or_else(|| HL7Error::MissingField("Patient ID (PID.3)".to_string()))?;

        let field = |segment: &str, position: usize| text(message, FieldPath::new(segment, position));
        let component = |segment: &str, position: usize, component: usize| {
            text(message, FieldPath::new(segment, position).component(component))
        };

        Ok(AdmissionSummary {
            sending_application: field("MSH", 3),
            sending_facility: field("MSH", 4),
            receiving_application: field("MSH", 5),
            receiving_facility: field("MSH", 6),
            message_type,
            control_id: message.control_id().map(str::to_string),
            version: message.version().map(str::to_string),
            event_type: field("EVN", 1),
            recorded_at: field("EVN", 2),
            patient_id,
            family_name: component("PID", 5, 1),
            given_name: component("PID", 5, 2),
            date_of_birth: field("PID", 7),
            sex: field("PID", 8),
            race: component("PID", 10, 1),
            street: component("PID", 11, 1),
            city: component("PID", 11, 3),
            state: component("PID", 11, 4),
            zip: component("PID", 11, 5),
            set_id: field("PV1", 1),
            patient_class: field("PV1", 2),
            point_of_care: component("PV1", 3, 2),
            attending_doctor: component("PV1", 7, 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_summary_requires_adt_and_patient_id() {
        let oru = MessageBuilder::default()
            .field("MSH", 9, Field::from_components(["ORU", "R01"]))
            .build()
            .unwrap();
        assert!(matches!(
            AdmissionSummary::from_hl7(&oru),
            Err(HL7Error::InvalidStructure(_))
        ));

        let no_pid = MessageBuilder::default()
            .field("MSH", 9, Field::from_components(["ADT", "A01"]))
            .build()
            .unwrap();
        assert_eq!(
            AdmissionSummary::from_hl7(&no_pid).unwrap_err(),
            HL7Error::MissingField("PID segment".to_string())
        );

        let empty_id = MessageBuilder::default()
            .field("MSH", 9, Field::from_components(["ADT", "A01"]))
            .field("PID", 5, "DOE")
            .build()
            .unwrap();
        assert_eq!(
            AdmissionSummary::from_hl7(&empty_id).unwrap_err(),
            HL7Error::MissingField("Patient ID (PID.3)".to_string())
        );
    }

    #[test]
    fn test_summary_of_minimal_admission() {
        let admission = PatientAdmission {
            patient_id: "12345".to_string(),
            family_name: "DOE".to_string(),
            given_name: "JANE".to_string(),
            patient_class: "O".to_string(),
            ..PatientAdmission::default()
        };
        let message = admission.to_message(Delimiters::default()).unwrap();
        let summary = AdmissionSummary::from_hl7(&message).unwrap();
        assert_eq!(summary.message_type, "ADT^A01");
        assert_eq!(summary.event_type.as_deref(), Some("A01"));
        assert_eq!(summary.patient_id, "12345");
        assert_eq!(summary.family_name.as_deref(), Some("DOE"));
        assert_eq!(summary.given_name.as_deref(), Some("JANE"));
        assert_eq!(summary.patient_class.as_deref(), Some("O"));
        assert_eq!(summary.sending_application, None);
        assert_eq!(summary.point_of_care, None);
    }
}
