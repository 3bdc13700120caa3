//! Lead fixtures shared by the pipeline and end-to-end tests

/// A lead the scripted provider (or a seeded sandbox provider) serves.
#[derive(Debug, Clone, Copy)]
pub struct LeadFixture {
    pub external_id: &'static str,
    pub state: &'static str,
    pub property_type: &'static str,
    pub description: &'static str,
}

pub const LEAD_FIXTURES: &[LeadFixture] = &[
    LeadFixture {
        external_id: "FX-1001",
        state: "CA",
        property_type: "single_family",
        description: "Plain single-family lead",
    },
    LeadFixture {
        external_id: "FX-1002",
        state: "CA",
        property_type: "condo",
        description: "Condo in the same bucket state",
    },
    LeadFixture {
        external_id: "FX-1003",
        state: "TX",
        property_type: "multi_family",
        description: "Multi-family lead in a second state",
    },
    LeadFixture {
        external_id: "FX-1004",
        state: "TX",
        property_type: "land",
        description: "Vacant land parcel",
    },
    LeadFixture {
        external_id: "FX-1005",
        state: "NY",
        property_type: "houseboat",
        description: "Unknown property type, minted with the 'O' type code",
    },
];

/// Ids the sandbox provider is expected to reject per record.
pub const REJECTED_IDS: &[&str] = &["FX-9001", "FX-9002"];

pub fn fixture_ids() -> Vec<String> {
    LEAD_FIXTURES
        .iter()
        .map(|f| f.external_id.to_string())
        .collect()
}
