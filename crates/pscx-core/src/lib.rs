//! Practitioner record model, unwinding and fixed-column row rendering for PSCX.

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "pscx-core";

/// Number of `|`-terminated fields in every published line, header included.
pub const FIELD_COUNT: usize = 51;

const PERSON_FIELDS: usize = 13;
const PROFESSION_FIELDS: usize = 5;
const EXPERTISE_FIELDS: usize = 2;
const WORK_SITUATION_FIELDS: usize = 4;
const STRUCTURE_FIELDS: usize = 24;
/// Work-situation codes, structure and registration authority.
const WORK_SITUATION_BLOCK: usize = WORK_SITUATION_FIELDS + STRUCTURE_FIELDS + 1;
const PROFESSION_BLOCK: usize = PROFESSION_FIELDS + EXPERTISE_FIELDS + WORK_SITUATION_BLOCK;

/// Rendered in place of an absent or empty given-name list.
pub const EMPTY_FIRST_NAMES: &str = "''";

pub const COLUMNS: [&str; FIELD_COUNT] = [
    "Type d'identifiant PP",
    "Identifiant PP",
    "Identification nationale PP",
    "Nom de famille",
    "Prénoms",
    "Date de naissance",
    "Code commune de naissance",
    "Code pays de naissance",
    "Lieu de naissance",
    "Code sexe",
    "Téléphone (coord. correspondance)",
    "Adresse e-mail (coord. correspondance)",
    "Code civilité",
    "Code profession",
    "Code catégorie professionnelle",
    "Code civilité d'exercice",
    "Nom d'exercice",
    "Prénom d'exercice",
    "Code type savoir-faire",
    "Code savoir-faire",
    "Code mode exercice",
    "Code secteur d'activité",
    "Code section tableau pharmaciens",
    "Code rôle",
    "Numéro SIRET site",
    "Numéro SIREN site",
    "Numéro FINESS site",
    "Numéro FINESS établissement juridique",
    "Identifiant technique de la structure",
    "Raison sociale site",
    "Enseigne commerciale site",
    "Complément destinataire (coord. structure)",
    "Complément point géographique (coord. structure)",
    "Numéro Voie (coord. structure)",
    "Indice répétition voie (coord. structure)",
    "Code type de voie (coord. structure)",
    "Libellé Voie (coord. structure)",
    "Mention distribution (coord. structure)",
    "Bureau cedex (coord. structure)",
    "Code postal (coord. structure)",
    "Code commune (coord. structure)",
    "Code pays (coord. structure)",
    "Téléphone (coord. structure)",
    "Téléphone 2 (coord. structure)",
    "Télécopie (coord. structure)",
    "Adresse e-mail (coord. structure)",
    "Code département (coord. structure)",
    "Ancien identifiant de la structure",
    "Autorité d'enregistrement",
    "Autres identifiants",
    "Code genre d'activité",
];

/// Header line of the published table, newline-terminated.
pub fn header_line() -> String {
    let mut line = String::with_capacity(1024);
    for column in COLUMNS {
        line.push_str(column);
        line.push('|');
    }
    line.push('\n');
    line
}

fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A practitioner as delivered by the upstream registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Record {
    pub id_type: Option<String>,
    pub id: Option<String>,
    pub national_id: Option<String>,
    pub last_name: Option<String>,
    #[serde(deserialize_with = "nullable_vec")]
    pub first_names: Vec<FirstName>,
    pub date_of_birth: Option<String>,
    pub birth_address_code: Option<String>,
    pub birth_country_code: Option<String>,
    pub birth_address: Option<String>,
    pub gender_code: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub salutation_code: Option<String>,
    #[serde(deserialize_with = "nullable_vec")]
    pub professions: Vec<Profession>,
    #[serde(deserialize_with = "nullable_vec")]
    pub ids: Vec<String>,
    pub activated: Option<i64>,
    pub deactivated: Option<i64>,
}

impl Record {
    /// True when the latest lifecycle transition is an activation.
    pub fn is_active(&self) -> bool {
        match (self.activated, self.deactivated) {
            (_, None) => true,
            (Some(activated), Some(deactivated)) => deactivated < activated,
            (None, Some(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FirstName {
    pub first_name: Option<String>,
    pub order: i32,
}

impl FirstName {
    pub fn new(first_name: impl Into<String>, order: i32) -> Self {
        Self {
            first_name: Some(first_name.into()),
            order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Profession {
    pub ex_pro_id: Option<String>,
    pub code: Option<String>,
    pub category_code: Option<String>,
    pub salutation_code: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    #[serde(deserialize_with = "nullable_vec")]
    pub expertises: Vec<Expertise>,
    #[serde(deserialize_with = "nullable_vec")]
    pub work_situations: Vec<WorkSituation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Expertise {
    pub expertise_id: Option<String>,
    pub type_code: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkSituation {
    pub situ_id: Option<String>,
    pub mode_code: Option<String>,
    pub activity_sector_code: Option<String>,
    pub pharmacist_table_section_code: Option<String>,
    pub role_code: Option<String>,
    pub activity_kind_code: Option<String>,
    pub registration_authority: Option<String>,
    pub structure: Option<Structure>,
}

/// Facility or establishment a practitioner works in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Structure {
    #[serde(rename = "siteSIRET")]
    pub site_siret: Option<String>,
    #[serde(rename = "siteSIREN")]
    pub site_siren: Option<String>,
    #[serde(rename = "siteFINESS")]
    pub site_finess: Option<String>,
    #[serde(rename = "legalEstablishmentFINESS")]
    pub legal_establishment_finess: Option<String>,
    pub structure_technical_id: Option<String>,
    pub legal_commercial_name: Option<String>,
    pub public_commercial_name: Option<String>,
    pub recipient_additional_info: Option<String>,
    pub geo_location_additional_info: Option<String>,
    pub street_number: Option<String>,
    pub street_number_repetition_index: Option<String>,
    pub street_category_code: Option<String>,
    pub street_label: Option<String>,
    pub distribution_mention: Option<String>,
    pub cedex_office: Option<String>,
    pub postal_code: Option<String>,
    pub commune_code: Option<String>,
    pub country_code: Option<String>,
    pub phone: Option<String>,
    pub phone2: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub department_code: Option<String>,
    pub old_structure_id: Option<String>,
}

impl Structure {
    fn fields(&self) -> [Option<&str>; STRUCTURE_FIELDS] {
        [
            self.site_siret.as_deref(),
            self.site_siren.as_deref(),
            self.site_finess.as_deref(),
            self.legal_establishment_finess.as_deref(),
            self.structure_technical_id.as_deref(),
            self.legal_commercial_name.as_deref(),
            self.public_commercial_name.as_deref(),
            self.recipient_additional_info.as_deref(),
            self.geo_location_additional_info.as_deref(),
            self.street_number.as_deref(),
            self.street_number_repetition_index.as_deref(),
            self.street_category_code.as_deref(),
            self.street_label.as_deref(),
            self.distribution_mention.as_deref(),
            self.cedex_office.as_deref(),
            self.postal_code.as_deref(),
            self.commune_code.as_deref(),
            self.country_code.as_deref(),
            self.phone.as_deref(),
            self.phone2.as_deref(),
            self.fax.as_deref(),
            self.email.as_deref(),
            self.department_code.as_deref(),
            self.old_structure_id.as_deref(),
        ]
    }
}

/// One practitioner with at most one profession / expertise / work-situation.
///
/// Borrows from the source [`Record`]; it never outlives the page it was
/// unwound from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlattenedRecord<'a> {
    pub record: &'a Record,
    pub profession: Option<&'a Profession>,
    pub expertise: Option<&'a Expertise>,
    pub work_situation: Option<&'a WorkSituation>,
}

impl<'a> FlattenedRecord<'a> {
    pub fn ids(&self) -> &'a [String] {
        &self.record.ids
    }

    /// One line per identifier of the practitioner.
    pub fn rows(self) -> impl Iterator<Item = String> + 'a {
        self.record.ids.iter().map(move |id| format_row(&self, id))
    }
}

/// Expand one record into its profession × expertise × work-situation rows.
///
/// Inactive records yield nothing. Absent and empty lists are treated alike.
pub fn unwind(record: &Record) -> Vec<FlattenedRecord<'_>> {
    if !record.is_active() {
        return Vec::new();
    }

    let flat = |profession, expertise, work_situation| FlattenedRecord {
        record,
        profession,
        expertise,
        work_situation,
    };

    if record.professions.is_empty() {
        return vec![flat(None, None, None)];
    }

    let mut out = Vec::new();
    for profession in &record.professions {
        match (
            profession.expertises.is_empty(),
            profession.work_situations.is_empty(),
        ) {
            (true, true) => out.push(flat(Some(profession), None, None)),
            (true, false) => out.extend(
                profession
                    .work_situations
                    .iter()
                    .map(|ws| flat(Some(profession), None, Some(ws))),
            ),
            (false, true) => out.extend(
                profession
                    .expertises
                    .iter()
                    .map(|ex| flat(Some(profession), Some(ex), None)),
            ),
            (false, false) => {
                for expertise in &profession.expertises {
                    out.extend(
                        profession
                            .work_situations
                            .iter()
                            .map(|ws| flat(Some(profession), Some(expertise), Some(ws))),
                    );
                }
            }
        }
    }
    out
}

/// Unwind a whole page, preserving record order.
pub fn unwind_page(records: &[Record]) -> impl Iterator<Item = FlattenedRecord<'_>> {
    records.iter().flat_map(unwind)
}

/// Identifier families recognised in the "other identifiers" column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Adeli,
    Finess,
    Siren,
    Siret,
    Rpps,
}

impl IdentifierKind {
    pub fn of(id: &str) -> Self {
        match id.chars().next() {
            Some('3') => Self::Finess,
            Some('4') => Self::Siren,
            Some('5') => Self::Siret,
            Some('6') | Some('8') => Self::Rpps,
            _ => Self::Adeli,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adeli => "ADELI",
            Self::Finess => "FINESS",
            Self::Siren => "SIREN",
            Self::Siret => "SIRET",
            Self::Rpps => "RPPS",
        }
    }
}

/// `<id>,<TYPE>,1` for one identifier; empty for an empty identifier.
pub fn link_string(id: &str) -> String {
    if id.is_empty() {
        return String::new();
    }
    format!("{id},{},1", IdentifierKind::of(id).as_str())
}

pub fn render_ids(ids: &[String]) -> String {
    ids.iter()
        .map(|id| link_string(id))
        .collect::<Vec<_>>()
        .join(";")
}

/// Given names ordered by `order`, apostrophe-joined.
pub fn render_first_names(first_names: &[FirstName]) -> String {
    if first_names.is_empty() {
        return EMPTY_FIRST_NAMES.to_string();
    }
    let mut sorted = first_names.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|name| name.order);
    sorted
        .iter()
        .map(|name| name.first_name.as_deref().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("'")
}

struct RowBuilder {
    line: String,
    fields: usize,
}

impl RowBuilder {
    fn new() -> Self {
        Self {
            line: String::with_capacity(512),
            fields: 0,
        }
    }

    fn push(&mut self, value: &str) {
        self.line.push_str(value);
        self.line.push('|');
        self.fields += 1;
    }

    fn push_opt(&mut self, value: Option<&str>) {
        self.push(value.unwrap_or_default());
    }

    fn push_empty(&mut self, count: usize) {
        for _ in 0..count {
            self.push("");
        }
    }

    fn finish(mut self) -> String {
        debug_assert_eq!(self.fields, FIELD_COUNT);
        self.line.push('\n');
        self.line
    }
}

/// Render one output line for `flat` keyed by `id`.
pub fn format_row(flat: &FlattenedRecord<'_>, id: &str) -> String {
    let record = flat.record;
    let mut row = RowBuilder::new();

    let mut chars = id.chars();
    let id_type = chars.next().map(String::from).unwrap_or_default();
    row.push(&id_type);
    row.push(chars.as_str());
    row.push(id);
    row.push_opt(record.last_name.as_deref());
    row.push(&render_first_names(&record.first_names));
    row.push_opt(record.date_of_birth.as_deref());
    row.push_opt(record.birth_address_code.as_deref());
    row.push_opt(record.birth_country_code.as_deref());
    row.push_opt(record.birth_address.as_deref());
    row.push_opt(record.gender_code.as_deref());
    row.push_opt(record.phone.as_deref());
    row.push_opt(record.email.as_deref());
    row.push_opt(record.salutation_code.as_deref());
    debug_assert_eq!(row.fields, PERSON_FIELDS);

    let mut activity_kind_code = "";
    match flat.profession {
        Some(profession) => {
            row.push_opt(profession.code.as_deref());
            row.push_opt(profession.category_code.as_deref());
            row.push_opt(profession.salutation_code.as_deref());
            row.push_opt(profession.last_name.as_deref());
            row.push_opt(profession.first_name.as_deref());

            match flat.expertise {
                Some(expertise) => {
                    row.push_opt(expertise.type_code.as_deref());
                    row.push_opt(expertise.code.as_deref());
                }
                None => row.push_empty(EXPERTISE_FIELDS),
            }

            match flat.work_situation {
                Some(ws) => {
                    row.push_opt(ws.mode_code.as_deref());
                    row.push_opt(ws.activity_sector_code.as_deref());
                    row.push_opt(ws.pharmacist_table_section_code.as_deref());
                    row.push_opt(ws.role_code.as_deref());
                    match &ws.structure {
                        Some(structure) => {
                            for field in structure.fields() {
                                row.push_opt(field);
                            }
                        }
                        None => row.push_empty(STRUCTURE_FIELDS),
                    }
                    row.push_opt(ws.registration_authority.as_deref());
                    activity_kind_code = ws.activity_kind_code.as_deref().unwrap_or_default();
                }
                None => row.push_empty(WORK_SITUATION_BLOCK),
            }
        }
        None => row.push_empty(PROFESSION_BLOCK),
    }

    row.push(&render_ids(&record.ids));
    row.push(activity_kind_code);
    row.finish()
}
