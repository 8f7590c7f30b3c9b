//! Metric catalog and value coercion.
//!
//! The catalog is a closed data table mapping each metric name to its
//! semantic type. Coercion, canonicalisation and SQL column spellings are
//! all driven from here; nothing downstream inspects raw value shapes.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::config::Environment;
use crate::errors::ApiError;
use crate::models::request::SqlValue;

pub const MAX_QUERY_PARAMS: usize = 5;
pub const MAX_STRUCTURE_LENGTH: usize = 8;
pub const MAX_DATE_QUERIES: usize = 1;
pub const MAX_ITEMS_PER_RESPONSE: usize = 2500;

pub const DATE_PARAM_NAME: &str = "date";
pub const REPORT_DATE_PARAM_NAME: &str = "releaseTimestamp";

/// Identity columns present in every query output, independent of the
/// requested structure.
pub const IDENTITY_COLUMNS: [&str; 4] = ["areaCode", "areaType", "areaName", "date"];

/// Semantic type of a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Int,
    Float,
    Text,
    JsonArray,
    JsonObject,
    Timestamp,
}

impl MetricType {
    pub fn expectation(self) -> &'static str {
        match self {
            Self::Int => "integer",
            Self::Float => "floating point",
            Self::Text => "string",
            Self::JsonArray => "array",
            Self::JsonObject => "object",
            Self::Timestamp => "date",
        }
    }
}

const TEXT_PATTERN: &str = "[A-Za-z]+";
const INT_PATTERN: &str = r"\d{1,7}";
const FLOAT_PATTERN: &str = "[0-9.]{1,8}";
const TIMESTAMP_PATTERN: &str = r"\d{4}-\d{2}-\d{2}";

static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(TEXT_PATTERN).unwrap());
static INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(INT_PATTERN).unwrap());
static FLOAT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(FLOAT_PATTERN).unwrap());
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(TIMESTAMP_PATTERN).unwrap());

/// Input pattern for filter values of a given semantic type. Composite
/// (JSON) metrics are not filterable and have no pattern.
pub fn type_pattern(semantic: MetricType) -> Option<(&'static Regex, &'static str)> {
    match semantic {
        MetricType::Text => Some((&TEXT_RE, TEXT_PATTERN)),
        MetricType::Int => Some((&INT_RE, INT_PATTERN)),
        MetricType::Float => Some((&FLOAT_RE, FLOAT_PATTERN)),
        MetricType::Timestamp => Some((&TIMESTAMP_RE, TIMESTAMP_PATTERN)),
        MetricType::JsonArray | MetricType::JsonObject => None,
    }
}

use MetricType::{Float, Int, JsonArray, Text, Timestamp};

/// Production catalog. Append-only.
const PROD_METRICS: &[(&str, MetricType)] = &[
    ("hash", Text),
    ("areaType", Text),
    ("date", Timestamp),
    ("areaName", Text),
    ("areaNameLower", Text),
    ("areaCode", Text),
    ("covidOccupiedMVBeds", Int),
    ("covidOccupiedMVBedsWeekly", Int),
    ("cumAdmissions", Int),
    ("cumCasesByPublishDate", Int),
    ("cumPillarFourTestsByPublishDate", Int),
    ("cumPillarOneTestsByPublishDate", Int),
    ("cumPillarThreeTestsByPublishDate", Int),
    ("cumPillarTwoTestsByPublishDate", Int),
    ("cumTestsByPublishDate", Int),
    ("hospitalCases", Int),
    ("hospitalCases_archive", Int),
    ("hospitalCasesWeekly", Int),
    ("hospitalCasesWeekly_archive", Int),
    ("newAdmissions", Int),
    ("newAdmissions_archive", Int),
    ("newAdmissionsWeekly", Int),
    ("newAdmissionsWeekly_archive", Int),
    ("newCasesByPublishDate", Int),
    ("newPillarFourTestsByPublishDate", Int),
    ("newPillarOneTestsByPublishDate", Int),
    ("newPillarThreeTestsByPublishDate", Int),
    ("newPillarTwoTestsByPublishDate", Int),
    ("newTestsByPublishDate", Int),
    ("plannedCapacityByPublishDate", Int),
    ("newCasesBySpecimenDate", Int),
    ("cumCasesBySpecimenDate", Int),
    ("maleCases", JsonArray),
    ("femaleCases", JsonArray),
    ("cumAdmissionsByAge", JsonArray),
    ("femaleDeaths28Days", JsonArray),
    ("maleDeaths28Days", JsonArray),
    ("changeInNewCasesBySpecimenDate", Int),
    ("previouslyReportedNewCasesBySpecimenDate", Int),
    ("cumCasesBySpecimenDateRate", Float),
    ("cumCasesByPublishDateRate", Float),
    ("release", Timestamp),
    ("newDeathsByDeathDate", Int),
    ("newDeathsByDeathDateRate", Float),
    ("newDeathsByDeathDateRollingRate", Float),
    ("newDeathsByDeathDateRollingSum", Int),
    ("cumDeathsByDeathDate", Int),
    ("cumDeathsByDeathDateRate", Float),
    ("newDeathsByPublishDate", Int),
    ("cumDeathsByPublishDate", Int),
    ("cumDeathsByPublishDateRate", Float),
    ("newDeaths28DaysByDeathDate", Int),
    ("newDeaths28DaysByDeathDateRate", Float),
    ("newDeaths28DaysByDeathDateRollingRate", Float),
    ("newDeaths28DaysByDeathDateRollingSum", Int),
    ("cumDeaths28DaysByDeathDate", Int),
    ("cumDeaths28DaysByDeathDateRate", Float),
    ("newDeaths28DaysByPublishDate", Int),
    ("cumDeaths28DaysByPublishDate", Int),
    ("cumDeaths28DaysByPublishDateRate", Float),
    ("newDeaths60DaysByDeathDate", Int),
    ("newDeaths60DaysByDeathDateRate", Float),
    ("newDeaths60DaysByDeathDateRollingRate", Float),
    ("newDeaths60DaysByDeathDateRollingSum", Int),
    ("cumDeaths60DaysByDeathDate", Int),
    ("cumDeaths60DaysByDeathDateRate", Float),
    ("newDeaths60DaysByPublishDate", Int),
    ("cumDeaths60DaysByPublishDate", Int),
    ("cumDeaths60DaysByPublishDateRate", Float),
    ("newOnsDeathsByRegistrationDate", Int),
    ("cumOnsDeathsByRegistrationDate", Int),
    ("cumOnsDeathsByRegistrationDateRate", Float),
    ("capacityPillarOneTwoFour", Int),
    ("newPillarOneTwoTestsByPublishDate", Int),
    ("capacityPillarOneTwo", Int),
    ("capacityPillarThree", Int),
    ("capacityPillarOne", Int),
    ("capacityPillarTwo", Int),
    ("capacityPillarFour", Int),
    ("cumPillarOneTwoTestsByPublishDate", Int),
    ("newPCRTestsByPublishDate", Int),
    ("cumPCRTestsByPublishDate", Int),
    ("plannedPCRCapacityByPublishDate", Int),
    ("plannedAntibodyCapacityByPublishDate", Int),
    ("newAntibodyTestsByPublishDate", Int),
    ("cumAntibodyTestsByPublishDate", Int),
    ("alertLevel", Int),
    ("transmissionRateMin", Float),
    ("transmissionRateMax", Float),
    ("transmissionRateGrowthRateMin", Float),
    ("transmissionRateGrowthRateMax", Float),
    ("newLFDTestsBySpecimenDate", Int),
    ("cumLFDTestsBySpecimenDate", Int),
    ("newVirusTestsByPublishDate", Int),
    ("cumVirusTestsByPublishDate", Int),
    ("newCasesBySpecimenDateDirection", Text),
    ("newCasesBySpecimenDateChange", Int),
    ("newCasesBySpecimenDateChangePercentage", Float),
    ("newCasesBySpecimenDateRollingSum", Int),
    ("newCasesBySpecimenDateRollingRate", Float),
    ("newCasesByPublishDateDirection", Text),
    ("newCasesByPublishDateChange", Int),
    ("newCasesByPublishDateChangePercentage", Float),
    ("newCasesByPublishDateRollingSum", Int),
    ("newCasesByPublishDateRollingRate", Float),
    ("newAdmissionsDirection", Text),
    ("newAdmissionsChange", Int),
    ("newAdmissionsChangePercentage", Float),
    ("newAdmissionsRollingSum", Int),
    ("newAdmissionsRollingRate", Float),
    ("newDeaths28DaysByPublishDateDirection", Text),
    ("newDeaths28DaysByPublishDateChange", Int),
    ("newDeaths28DaysByPublishDateChangePercentage", Float),
    ("newDeaths28DaysByPublishDateRollingSum", Int),
    ("newDeaths28DaysByPublishDateRollingRate", Float),
    ("newPCRTestsByPublishDateDirection", Text),
    ("newPCRTestsByPublishDateChange", Int),
    ("newPCRTestsByPublishDateChangePercentage", Float),
    ("newPCRTestsByPublishDateRollingSum", Int),
    ("newPCRTestsByPublishDateRollingRate", Float),
    ("newVirusTestsDirection", Text),
    ("newVirusTestsChange", Int),
    ("newVirusTestsChangePercentage", Float),
    ("newVirusTestsRollingSum", Int),
    ("newVirusTestsRollingRate", Float),
    ("newCasesByPublishDateAgeDemographics", JsonArray),
    ("newCasesBySpecimenDateAgeDemographics", JsonArray),
    ("newDeaths28DaysByDeathDateAgeDemographics", JsonArray),
    ("variants", JsonArray),
    ("uniqueCasePositivityBySpecimenDateRollingSum", Float),
    ("uniquePeopleTestedBySpecimenDateRollingSum", Int),
    ("newDailyNsoDeathsByDeathDateChange", Int),
    ("newDailyNsoDeathsByDeathDateChangePercentage", Float),
    ("newDailyNsoDeathsByDeathDateDirection", Text),
    ("newDailyNsoDeathsByDeathDateRollingSum", Int),
    ("newDailyNsoDeathsByDeathDate", Int),
    ("cumDailyNsoDeathsByDeathDate", Int),
    ("cumWeeklyNsoDeathsByRegDate", Int),
    ("cumWeeklyNsoDeathsByRegDateRate", Float),
    ("newWeeklyNsoDeathsByRegDate", Int),
    ("cumWeeklyNsoCareHomeDeathsByRegDate", Int),
    ("newWeeklyNsoCareHomeDeathsByRegDate", Int),
    ("newPeopleReceivingFirstDose", Int),
    ("cumPeopleReceivingFirstDose", Int),
    ("newPeopleReceivingSecondDose", Int),
    ("cumPeopleReceivingSecondDose", Int),
    ("cumPeopleVaccinatedFirstDoseByPublishDate", Int),
    ("cumPeopleVaccinatedSecondDoseByPublishDate", Int),
    ("newPeopleVaccinatedFirstDoseByPublishDate", Int),
    ("cumPeopleVaccinatedCompleteByPublishDate", Int),
    ("newPeopleVaccinatedCompleteByPublishDate", Int),
    ("newPeopleVaccinatedSecondDoseByPublishDate", Int),
    ("weeklyPeopleVaccinatedFirstDoseByVaccinationDate", Int),
    ("weeklyPeopleVaccinatedSecondDoseByVaccinationDate", Int),
    ("cumPeopleVaccinatedSecondDoseByVaccinationDate", Int),
    ("newCasesLFDConfirmedPCRBySpecimenDateRollingSum", Int),
    ("newCasesLFDConfirmedPCRBySpecimenDate", Int),
    ("newCasesLFDConfirmedPCRBySpecimenDateRollingRate", Float),
    ("cumCasesLFDOnlyBySpecimenDate", Int),
    ("cumCasesPCROnlyBySpecimenDate", Int),
    ("newCasesPCROnlyBySpecimenDateRollingSum", Int),
    ("newCasesLFDOnlyBySpecimenDateRollingRate", Float),
    ("newCasesPCROnlyBySpecimenDateRollingRate", Float),
    ("newCasesLFDOnlyBySpecimenDateRollingSum", Int),
    ("cumCasesLFDConfirmedPCRBySpecimenDate", Int),
    ("newCasesPCROnlyBySpecimenDate", Int),
    ("newCasesLFDOnlyBySpecimenDate", Int),
    ("newVaccinesGivenByPublishDate", Int),
    ("cumVaccinesGivenByPublishDate", Int),
    ("cumVaccinationFirstDoseUptakeByPublishDatePercentage", Float),
    ("cumVaccinationSecondDoseUptakeByPublishDatePercentage", Float),
    ("cumVaccinationCompleteCoverageByPublishDatePercentage", Float),
    ("newPeopleVaccinatedFirstDoseByVaccinationDate", Int),
    ("cumPeopleVaccinatedFirstDoseByVaccinationDate", Int),
    ("cumVaccinationSecondDoseUptakeByVaccinationDatePercentage", Float),
    ("VaccineRegisterPopulationByVaccinationDate", Int),
    ("newPeopleVaccinatedSecondDoseByVaccinationDate", Int),
    ("cumPeopleVaccinatedCompleteByVaccinationDate", Int),
    ("cumVaccinationFirstDoseUptakeByVaccinationDatePercentage", Float),
    ("cumVaccinationCompleteCoverageByVaccinationDatePercentage", Float),
    ("newPeopleVaccinatedCompleteByVaccinationDate", Int),
    ("vaccinationsAgeDemographics", JsonArray),
    ("cumPeopleVaccinatedThirdDoseByPublishDate", Int),
    ("newPeopleVaccinatedThirdDoseByPublishDate", Int),
    ("cumVaccinationBoosterDoseUptakeByPublishDatePercentage", Float),
    ("cumPeopleVaccinatedThirdInjectionByPublishDate", Int),
    ("newPeopleVaccinatedThirdInjectionByPublishDate", Int),
    ("newPeopleVaccinatedBoosterDoseByPublishDate", Int),
    ("cumVaccinationThirdInjectionUptakeByPublishDatePercentage", Float),
    ("cumPeopleVaccinatedBoosterDoseByPublishDate", Int),
    ("cumPeopleVaccinatedAutumn22ByVaccinationDate50plus", Int),
    ("cumVaccinationAutumn22UptakeByVaccinationDatePercentage50plus", Float),
    ("newPeopleVaccinatedSpring23ByVaccinationDate75plus", Int),
    ("cumPeopleVaccinatedSpring23ByVaccinationDate75plus", Int),
    ("cumVaccinationSpring23UptakeByVaccinationDatePercentage75plus", Float),
    ("newPeopleVaccinatedAutumn23ByVaccinationDate65plus", Int),
    ("cumPeopleVaccinatedAutumn23ByVaccinationDate65plus", Int),
    ("cumVaccinationAutumn23UptakeByVaccinationDatePercentage65plus", Float),
    ("cumPCRTestsBySpecimenDate", Int),
    ("newPCRTestsBySpecimenDate", Int),
    ("newVirusTestsBySpecimenDate", Int),
    ("newVirusTestsBySpecimenDateChange", Int),
    ("newVirusTestsBySpecimenDateChangePercentage", Float),
    ("newVirusTestsBySpecimenDateDirection", Text),
    ("newVirusTestsBySpecimenDateRollingSum", Int),
    ("newVirusTestsByPublishDateRollingSum", Int),
    ("cumVirusTestsBySpecimenDate", Int),
    ("cumVaccinationThirdInjectionUptakeByVaccinationDatePercentage", Float),
    ("newPeopleVaccinatedThirdInjectionByVaccinationDate", Int),
    ("cumPeopleVaccinatedThirdInjectionByVaccinationDate", Int),
    ("cumFirstEpisodesBySpecimenDate", Int),
    ("cumFirstEpisodesBySpecimenDateRate", Float),
    ("cumReinfectionsBySpecimenDate", Int),
    ("cumReinfectionsBySpecimenDateRate", Float),
    ("newFirstEpisodesBySpecimenDate", Int),
    ("newFirstEpisodesBySpecimenDateChange", Int),
    ("newFirstEpisodesBySpecimenDateChangePercentage", Float),
    ("newFirstEpisodesBySpecimenDateDirection", Text),
    ("newFirstEpisodesBySpecimenDateRollingRate", Float),
    ("newFirstEpisodesBySpecimenDateRollingSum", Int),
    ("newReinfectionsBySpecimenDate", Int),
    ("newReinfectionsBySpecimenDateChange", Int),
    ("newReinfectionsBySpecimenDateChangePercentage", Float),
    ("newReinfectionsBySpecimenDateDirection", Text),
    ("newReinfectionsBySpecimenDateRollingRate", Float),
    ("newReinfectionsBySpecimenDateRollingSum", Int),
    ("changeInNewDeaths28DaysByDeathDate", Int),
    ("previouslyReportedNewDeaths28DaysByDeathDate", Int),
    ("newFirstEpisodesBySpecimenDateAgeDemographics", JsonArray),
    ("newReinfectionsBySpecimenDateAgeDemographics", JsonArray),
    ("newCasesPillarOneBySpecimenDate", Int),
    ("newCasesPillarOneBySpecimenDateDirection", Text),
    ("newCasesPillarOneBySpecimenDateChange", Int),
    ("newCasesPillarOneBySpecimenDateChangePercentage", Float),
    ("newCasesPillarOneBySpecimenDateRollingSum", Int),
    ("newCasesPillarOneBySpecimenDateRollingRate", Float),
    ("cumCasesPillarOneBySpecimenDate", Int),
    ("cumCasesPillarOneBySpecimenDateRate", Float),
    ("newCasesPillarTwoBySpecimenDate", Int),
    ("newCasesPillarTwoBySpecimenDateDirection", Text),
    ("newCasesPillarTwoBySpecimenDateChange", Int),
    ("newCasesPillarTwoBySpecimenDateChangePercentage", Float),
    ("newCasesPillarTwoBySpecimenDateRollingSum", Int),
    ("newCasesPillarTwoBySpecimenDateRollingRate", Float),
    ("cumCasesPillarTwoBySpecimenDate", Int),
    ("cumCasesPillarTwoBySpecimenDateRate", Float),
    ("newDeaths28DaysByDeathDateChange", Int),
    ("newDeaths28DaysByDeathDateChangePercentage", Float),
    ("newVirusTestsByPublishDateChange", Int),
    ("newVirusTestsByPublishDateChangePercentage", Float),
];

/// Metrics only served in development; the development catalog is the union
/// of the production table and these.
const DEV_ONLY_METRICS: &[(&str, MetricType)] = &[
    ("changeInCumCasesBySpecimenDate", Int),
    ("cumPeopleTestedBySpecimenDate", Int),
    ("covidOccupiedNIVBeds", Int),
    ("covidOccupiedOSBeds", Int),
    ("covidOccupiedOtherBeds", Int),
    ("cumDischarges", Int),
    ("cumDischargesByAge", JsonArray),
    ("cumNegativesBySpecimenDate", Int),
    ("cumPeopleTestedByPublishDate", Int),
    ("cumPillarOnePeopleTestedByPublishDate", Int),
    ("cumPillarTwoPeopleTestedByPublishDate", Int),
    ("femaleNegatives", JsonArray),
    ("maleNegatives", JsonArray),
    ("malePeopleTested", JsonArray),
    ("femalePeopleTested", JsonArray),
    ("newAdmissionsByAge", JsonArray),
    ("newDischarges", Int),
    ("newNegativesBySpecimenDate", Int),
    ("newPeopleTestedByPublishDate", Int),
    ("newPillarOnePeopleTestedByPublishDate", Int),
    ("newPillarTwoPeopleTestedByPublishDate", Int),
    ("nonCovidOccupiedMVBeds", Int),
    ("nonCovidOccupiedNIVBeds", Int),
    ("nonCovidOccupiedOSBeds", Int),
    ("nonCovidOccupiedOtherBeds", Int),
    ("plannedPillarFourCapacityByPublishDate", Int),
    ("plannedPillarOneCapacityByPublishDate", Int),
    ("plannedPillarThreeCapacityByPublishDate", Int),
    ("plannedPillarTwoCapacityByPublishDate", Int),
    ("previouslyReportedCumCasesBySpecimenDate", Int),
    ("suspectedCovidOccupiedMVBeds", Int),
    ("suspectedCovidOccupiedNIVBeds", Int),
    ("suspectedCovidOccupiedOSBeds", Int),
    ("suspectedCovidOccupiedOtherBeds", Int),
    ("totalBeds", Int),
    ("totalMVBeds", Int),
    ("totalNIVBeds", Int),
    ("totalOSBeds", Int),
    ("totalOtherBeds", Int),
    ("unoccupiedMVBeds", Int),
    ("unoccupiedNIVBeds", Int),
    ("unoccupiedOSBeds", Int),
    ("unoccupiedOtherBeds", Int),
    ("newPeopleTestedBySpecimenDate", Int),
    ("cumPeopleTestedByPublishDateRate", Float),
    ("cumAdmissionsRate", Float),
    ("cumDischargesRate", Float),
    ("newPillarOneTwoFourTestsByPublishDate", Int),
    ("newCasesBySpecimenDateRate", Float),
    ("newOnsCareHomeDeathsByRegistrationDate", Int),
    ("cumOnsCareHomeDeathsByRegistrationDate", Int),
];

static PROD_CATALOG: LazyLock<HashMap<&'static str, MetricType>> =
    LazyLock::new(|| PROD_METRICS.iter().copied().collect());

static DEV_CATALOG: LazyLock<HashMap<&'static str, MetricType>> = LazyLock::new(|| {
    PROD_METRICS
        .iter()
        .chain(DEV_ONLY_METRICS.iter())
        .copied()
        .collect()
});

/// The metric catalog for an environment. Read-only after initialisation.
pub fn data_types(env: Environment) -> &'static HashMap<&'static str, MetricType> {
    if env.is_development() { &DEV_CATALOG } else { &PROD_CATALOG }
}

pub fn type_of(env: Environment, metric: &str) -> Option<MetricType> {
    data_types(env).get(metric).copied()
}

/// Canonical spellings for the closed area-type set. Keys are lower-cased
/// caller input; values are the canonical wire form.
const AREA_TYPES: &[(&str, &str)] = &[
    ("utla", "utla"),
    ("ltla", "ltla"),
    ("region", "region"),
    ("nhsregion", "nhsRegion"),
    ("overview", "overview"),
    ("nation", "nation"),
    ("nhstrust", "nhsTrust"),
];

pub fn canonical_area_type(value: &str) -> Option<&'static str> {
    let lowered = value.to_lowercase();
    AREA_TYPES
        .iter()
        .find(|(key, _)| *key == lowered)
        .map(|(_, canonical)| *canonical)
}

/// SQL column spelling for a filter identifier. Identifiers without a
/// special spelling pass through unchanged.
pub fn column_spelling(name: &str) -> String {
    match name {
        "areaName" => "LOWER(area_name)".to_string(),
        "areaType" => "area_type".to_string(),
        "areaCode" => "area_code".to_string(),
        _ => name.to_string(),
    }
}

/// Values must be listed in lowercase. When a parameter has an entry here,
/// the API refuses any query whose value for it is not in the list.
static RESTRICTED_PARAMETER_VALUES: LazyLock<HashMap<&'static str, Vec<&'static str>>> =
    LazyLock::new(HashMap::new);

pub fn restricted_values() -> &'static HashMap<&'static str, Vec<&'static str>> {
    &RESTRICTED_PARAMETER_VALUES
}

pub fn is_permitted(
    table: &HashMap<&'static str, Vec<&'static str>>,
    name: &str,
    value: &str,
) -> bool {
    match table.get(name) {
        Some(allowed) => allowed.contains(&value.to_lowercase().as_str()),
        None => true,
    }
}

/// Convert a raw filter value to the type the database expects, enforcing
/// the per-type input pattern along the way.
pub fn coerce(
    env: Environment,
    name: &str,
    operator: &str,
    value: &str,
) -> Result<SqlValue, ApiError> {
    let invalid_parameter = || ApiError::InvalidQueryParameter {
        name: name.to_string(),
        operator: operator.to_string(),
        value: value.to_string(),
        closest_match: closest_match(name, data_types(env).keys().copied()),
    };

    let Some(semantic) = type_of(env, name) else {
        return Err(invalid_parameter());
    };

    // Composite metrics carry no filter pattern and cannot be queried on.
    let Some((pattern, pattern_source)) = type_pattern(semantic) else {
        return Err(invalid_parameter());
    };

    let expression = format!("{name} {operator} {value}");

    if !pattern.is_match(value) {
        return Err(ApiError::ValueNotAcceptable {
            expression,
            key: name.to_string(),
            pattern: pattern_source,
        });
    }

    let wrong_type = |expectation: &'static str| ApiError::IncorrectQueryValueType {
        expression: expression.clone(),
        expectation,
        actual: value.to_string(),
    };

    match semantic {
        MetricType::Text => Ok(SqlValue::Text(value.to_string())),
        MetricType::Int => value
            .parse::<i32>()
            .map(SqlValue::Int)
            .map_err(|_| wrong_type(semantic.expectation())),
        MetricType::Float => value
            .parse::<f64>()
            .map(SqlValue::Float)
            .map_err(|_| wrong_type(semantic.expectation())),
        MetricType::Timestamp => Ok(SqlValue::Text(format!("{value}T00:00:00.000000Z"))),
        // Ruled out above; composite metrics have no pattern.
        MetricType::JsonArray | MetricType::JsonObject => Err(invalid_parameter()),
    }
}

/// Apply the per-identifier argument transformation: lower-cased area names,
/// upper-cased area codes, canonical area types, dates bound as dates.
/// Returns `None` when the value cannot be canonicalised.
pub fn transform_argument(name: &str, value: SqlValue) -> Option<SqlValue> {
    match (name, value) {
        ("areaName", SqlValue::Text(s)) => Some(SqlValue::Text(s.to_lowercase())),
        ("areaCode", SqlValue::Text(s)) => Some(SqlValue::Text(s.to_uppercase())),
        ("areaType", SqlValue::Text(s)) => {
            canonical_area_type(&s).map(|canonical| SqlValue::Text(canonical.to_string()))
        }
        ("date", SqlValue::Text(s)) => {
            let day = s.split('T').next().unwrap_or(&s);
            NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .ok()
                .map(SqlValue::Date)
        }
        (_, value) => Some(value),
    }
}

/// Closest catalog entry to `value`, by longest-common-subsequence ratio.
/// Used in error messages to suggest what the caller probably meant.
pub fn closest_match<'a>(value: &str, options: impl Iterator<Item = &'a str>) -> String {
    let mut best_ratio = 0.0_f64;
    let mut best = String::new();

    for option in options {
        let lcs = lcs_length(value.as_bytes(), option.as_bytes());
        let denominator = (value.len() + option.len()) as f64;
        if denominator == 0.0 {
            continue;
        }
        let ratio = (2 * lcs) as f64 / denominator;
        if ratio > best_ratio {
            best_ratio = ratio;
            best = option.to_string();
        }
    }

    best
}

fn lcs_length(a: &[u8], b: &[u8]) -> usize {
    let mut previous = vec![0_usize; b.len() + 1];
    let mut current = vec![0_usize; b.len() + 1];

    for &byte_a in a {
        for (j, &byte_b) in b.iter().enumerate() {
            current[j + 1] = if byte_a == byte_b {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        assert_eq!(
            type_of(Environment::Production, "newCasesByPublishDate"),
            Some(MetricType::Int)
        );
        assert_eq!(
            type_of(Environment::Production, "maleCases"),
            Some(MetricType::JsonArray)
        );
        assert_eq!(type_of(Environment::Production, "nope"), None);
    }

    #[test]
    fn test_dev_catalog_is_superset() {
        let prod = data_types(Environment::Production);
        let dev = data_types(Environment::Development);
        for metric in prod.keys() {
            assert!(dev.contains_key(metric), "dev catalog missing {metric}");
        }
        assert!(dev.contains_key("totalBeds"));
        assert!(!prod.contains_key("totalBeds"));
    }

    #[test]
    fn test_coerce_int() {
        let value = coerce(Environment::Production, "newCasesByPublishDate", "=", "123").unwrap();
        assert_eq!(value, SqlValue::Int(123));
    }

    #[test]
    fn test_coerce_timestamp_normalisation() {
        let value = coerce(Environment::Production, "date", "=", "2023-05-25").unwrap();
        assert_eq!(value, SqlValue::Text("2023-05-25T00:00:00.000000Z".to_string()));
    }

    #[test]
    fn test_coerce_pattern_miss() {
        let err = coerce(Environment::Production, "date", "=", "25/05/2023").unwrap_err();
        assert!(matches!(err, ApiError::ValueNotAcceptable { .. }));
    }

    #[test]
    fn test_coerce_unknown_metric_suggests() {
        let err = coerce(Environment::Production, "newCasesByPublishDat", "=", "1").unwrap_err();
        match err {
            ApiError::InvalidQueryParameter { closest_match, .. } => {
                assert_eq!(closest_match, "newCasesByPublishDate");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_composite_metric_not_filterable() {
        let err = coerce(Environment::Production, "maleCases", "=", "abc").unwrap_err();
        assert!(matches!(err, ApiError::InvalidQueryParameter { .. }));
    }

    #[test]
    fn test_area_type_canonicalisation() {
        assert_eq!(canonical_area_type("NHSREGION"), Some("nhsRegion"));
        assert_eq!(canonical_area_type("nation"), Some("nation"));
        assert_eq!(canonical_area_type("county"), None);
    }

    #[test]
    fn test_transformations() {
        assert_eq!(
            transform_argument("areaName", SqlValue::Text("England".into())),
            Some(SqlValue::Text("england".into()))
        );
        assert_eq!(
            transform_argument("areaCode", SqlValue::Text("e92000001".into())),
            Some(SqlValue::Text("E92000001".into()))
        );
        assert_eq!(
            transform_argument("date", SqlValue::Text("2023-05-25T00:00:00.000000Z".into())),
            Some(SqlValue::Date(NaiveDate::from_ymd_opt(2023, 5, 25).unwrap()))
        );
        // Pass-through for everything else.
        assert_eq!(
            transform_argument("hospitalCases", SqlValue::Int(5)),
            Some(SqlValue::Int(5))
        );
    }

    #[test]
    fn test_column_spellings() {
        assert_eq!(column_spelling("areaName"), "LOWER(area_name)");
        assert_eq!(column_spelling("areaType"), "area_type");
        assert_eq!(column_spelling("areaCode"), "area_code");
        assert_eq!(column_spelling("date"), "date");
        assert_eq!(column_spelling("hospitalCases"), "hospitalCases");
    }

    #[test]
    fn test_allow_list() {
        let mut table: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
        table.insert("areaName", vec!["united kingdom"]);
        assert!(is_permitted(&table, "areaName", "United Kingdom"));
        assert!(!is_permitted(&table, "areaName", "England"));
        assert!(is_permitted(&table, "areaType", "nation"));
        // The default table is empty, so everything is permitted.
        assert!(is_permitted(restricted_values(), "areaName", "anything"));
    }

    #[test]
    fn test_closest_match_ratio() {
        let options = ["newCasesByPublishDate", "hospitalCases", "date"];
        assert_eq!(
            closest_match("hospitalCase", options.iter().copied()),
            "hospitalCases"
        );
        assert_eq!(closest_match("dte", options.iter().copied()), "date");
    }
}
