pub const DEFAULT_MIN_SAMPLE_SIZE: usize = 30;
pub const DEFAULT_TOP_RISK: usize = 25;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;
pub const REPORT_SCHEMA_VERSION: u32 = 1;

// Column aliases; the first entry is the canonical data-dictionary name.
pub const ROSTER_NPI: &[&str] = &["NPI", "provider_npi"];
pub const ROSTER_NAME: &[&str] = &["name", "provider_name", "display_name"];
pub const ROSTER_SPECIALTY: &[&str] = &["specialty", "provider_specialty", "primary_taxonomy_desc"];
pub const ROSTER_PROVIDER_TYPE: &[&str] = &["provider_type", "credential", "credentials"];

pub const PAYMENT_NPI: &[&str] = &["covered_recipient_npi", "recipient_npi"];
pub const PAYMENT_AMOUNT: &[&str] = &["total_amount_of_payment_usdollars", "amount"];
pub const PAYMENT_DATE: &[&str] = &["date_of_payment", "payment_date"];
pub const PAYMENT_PROGRAM_YEAR: &[&str] = &["program_year"];
pub const PAYMENT_RECORD_ID: &[&str] = &["record_id"];
pub const PAYMENT_NATURE: &[&str] = &["nature_of_payment_or_transfer_of_value", "category"];
pub const PAYMENT_DRUG: &[&str] = &[
    "name_of_drug_or_biological_or_device_or_medical_supply_1",
    "drug_name",
    "BRAND_NAME",
];
pub const PAYMENT_MANUFACTURER: &[&str] = &[
    "applicable_manufacturer_or_applicable_gpo_making_payment_name",
    "manufacturer_name",
];
pub const PAYMENT_MANUFACTURER_ID: &[&str] = &[
    "applicable_manufacturer_or_applicable_gpo_making_payment_id",
    "PAYOR_ID",
];

pub const RX_NPI: &[&str] = &["NPI", "prescriber_npi"];
pub const RX_BRAND: &[&str] = &["BRAND_NAME", "brand_name"];
pub const RX_GENERIC: &[&str] = &["GENERIC_NAME", "generic_name"];
pub const RX_CLAIMS: &[&str] = &["PRESCRIPTIONS", "claim_count", "total_claim_count"];
pub const RX_COST: &[&str] = &["PAYMENTS", "total_cost", "total_drug_cost"];
pub const RX_DAYS_SUPPLY: &[&str] = &["DAYS_SUPPLY", "total_day_supply"];
pub const RX_YEAR: &[&str] = &["CLAIM_YEAR", "year"];
pub const RX_MONTH: &[&str] = &["CLAIM_MONTH", "month"];

pub const UNKNOWN_SPECIALTY: &str = "Unknown";
pub const UNSPECIFIED_CATEGORY: &str = "Unspecified";
