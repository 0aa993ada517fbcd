//! Decoding and encoding of machine-readable zones.
//!
//! Five layouts are recognized: TD1 (credit-card size), TD2 (ISO 216 size A7), TD3 (passport,
//! ISO 216 size B7) and the machine-readable visas MRV-A and MRV-B.
//!
//! The TD1 encoding is:
//! ```plain
//! TTSSSNNNNNNNNNCOOOOOOOOOOOOOOO
//! BBBBBBDXEEEEEEFAAAPPPPPPPPPPPG
//! IIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! ```
//! with
//! * `TT`: type of document (right-padded with `<`)
//! * `SSS`: issuing state or organization (right-padded with `<`)
//! * `NNNNNNNNN`: first 9 characters of document number (right-padded with `<`)
//! * `C`: check digit of document number, or `<` if document number is longer than 9 characters
//! * `OOOOOOOOOOOOOOO`: optional data (right-padded with `<`); if document number is longer than 9
//!   characters, begins with the remaining characters of the document number followed by the
//!   check digit of the whole document number
//! * `BBBBBB`: date of birth as YYMMDD
//! * `D`: check digit of date of birth
//! * `X`: sex (`F`, `M`, `X`, or `<` for unspecified)
//! * `EEEEEE`: date of expiry as YYMMDD
//! * `F`: check digit of date of expiry
//! * `AAA`: nationality
//! * `PPPPPPPPPPP`: optional data (right-padded with `<`)
//! * `G`: composite check digit of `NNNNNNNNNCOOOOOOOOOOOOOOOBBBBBBDEEEEEEFPPPPPPPPPPP`
//! * `IIIIIIIIIIIIIIIIIIIIIIIIIIIIII`: name (primary identifier, `<<`, secondary identifier,
//!   components separated by `<`, right-padded with `<`, possibly truncated)
//!
//! The TD2 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOG
//! ```
//! The fields are as with TD1, except the composite check digit `G` is calculated from
//! `NNNNNNNNNCBBBBBBDEEEEEEFOOOOOOO`.
//!
//! The TD3 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOOOOOOOOQG
//! ```
//! The fields are as with TD1, except:
//! * `NNNNNNNNN` (passport number) cannot be longer than 9 characters
//! * `Q` is a check digit of `OOOOOOOOOOOOOO` (or `<` if it is empty)
//! * `G` (composite check digit) is calculated from
//!   `NNNNNNNNNCBBBBBBDEEEEEEFOOOOOOOOOOOOOOQ`
//!
//! MRV-A uses the TD3 line length and MRV-B the TD2 line length. Both have a document type
//! starting with `V`, no composite check digit, and optional data filling the rest of the second
//! line (16 characters for MRV-A, 8 for MRV-B).


use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use smallstr::SmallString;
use thiserror::Error;


const TD1_WIDTH: usize = 30;
const TD2_WIDTH: usize = 36;
const TD3_WIDTH: usize = 44;

/// Length of the document number field in every layout.
pub const DOCUMENT_NUMBER_LENGTH: usize = 9;


#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum ParseError {
    #[error("unrecognized MRZ layout ({lines} lines, first line {length} characters)")]
    InvalidLayout { lines: usize, length: usize },

    #[error("invalid character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },

    #[error("invalid sex marker {character:?}")]
    InvalidSex { character: char },

    #[error("check digit of {field} is {expected:?} but should be {computed}")]
    CheckDigit { field: &'static str, expected: char, computed: u8 },

    #[error("document number is empty")]
    EmptyDocumentNumber,

    #[error("document number has {length} characters, at most 9 are allowed")]
    DocumentNumberTooLong { length: usize },

    #[error("invalid date {value:?}")]
    InvalidDate { value: String },
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Variant {
    Td1,
    Td2,
    Td3,
    MrvA,
    MrvB,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Sex {
    Female,
    Male,
    Other,
    Unspecified,
}
impl Sex {
    fn from_char(c: char) -> Result<Self, ParseError> {
        match c {
            'F' => Ok(Self::Female),
            'M' => Ok(Self::Male),
            'X' => Ok(Self::Other),
            '<' => Ok(Self::Unspecified),
            other => Err(ParseError::InvalidSex { character: other }),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::Female => 'F',
            Self::Male => 'M',
            Self::Other => 'X',
            Self::Unspecified => '<',
        }
    }
}


/// All text fields keep their filler characters so that encoding reproduces the input exactly; use
/// [`trim_filler`] for display purposes.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Td1Data {
    /// Document type.
    pub document_type: SmallString<[u8; 2]>,

    /// Issuer state or organization of the document.
    pub issuer: SmallString<[u8; 3]>,

    /// First nine characters of the document number.
    pub document_number: SmallString<[u8; 9]>,

    /// Check digit of the document number, or `<` if the number continues in optional data 1.
    pub document_number_check: char,

    /// Optional data 1.
    pub optional_data_1: SmallString<[u8; 15]>,

    /// Date of birth.
    pub date_of_birth: SmallString<[u8; 6]>,

    /// Check digit for date of birth.
    pub date_of_birth_check: char,

    /// Sex.
    pub sex: Sex,

    /// Date of expiry.
    pub date_of_expiry: SmallString<[u8; 6]>,

    /// Check digit for date of expiry.
    pub date_of_expiry_check: char,

    /// Nationality of holder.
    pub nationality: SmallString<[u8; 3]>,

    /// Optional data 2.
    pub optional_data_2: SmallString<[u8; 11]>,

    /// Composite check digit.
    pub composite_check: char,

    /// Name of holder.
    pub name: SmallString<[u8; 39]>,
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Td2Data {
    pub document_type: SmallString<[u8; 2]>,
    pub issuer: SmallString<[u8; 3]>,
    pub name: SmallString<[u8; 39]>,
    pub document_number: SmallString<[u8; 9]>,
    pub document_number_check: char,
    pub nationality: SmallString<[u8; 3]>,
    pub date_of_birth: SmallString<[u8; 6]>,
    pub date_of_birth_check: char,
    pub sex: Sex,
    pub date_of_expiry: SmallString<[u8; 6]>,
    pub date_of_expiry_check: char,
    pub optional_data_1: SmallString<[u8; 15]>,
    pub composite_check: char,
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Td3Data {
    pub document_type: SmallString<[u8; 2]>,
    pub issuer: SmallString<[u8; 3]>,
    pub name: SmallString<[u8; 39]>,
    pub document_number: SmallString<[u8; 9]>,
    pub document_number_check: char,
    pub nationality: SmallString<[u8; 3]>,
    pub date_of_birth: SmallString<[u8; 6]>,
    pub date_of_birth_check: char,
    pub sex: Sex,
    pub date_of_expiry: SmallString<[u8; 6]>,
    pub date_of_expiry_check: char,

    /// Optional data 1 (personal number).
    pub optional_data_1: SmallString<[u8; 15]>,

    /// Check digit for optional data 1.
    pub optional_data_1_check: char,

    pub composite_check: char,
}


/// The data of a machine-readable visa; MRV-A and MRV-B only differ in line and optional data
/// length.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MrvData {
    pub document_type: SmallString<[u8; 2]>,
    pub issuer: SmallString<[u8; 3]>,
    pub name: SmallString<[u8; 39]>,
    pub document_number: SmallString<[u8; 9]>,
    pub document_number_check: char,
    pub nationality: SmallString<[u8; 3]>,
    pub date_of_birth: SmallString<[u8; 6]>,
    pub date_of_birth_check: char,
    pub sex: Sex,
    pub date_of_expiry: SmallString<[u8; 6]>,
    pub date_of_expiry_check: char,
    pub optional_data_1: SmallString<[u8; 16]>,
}


macro_rules! mrz_field {
    ($name:ident, $type:ty) => {
        pub fn $name(&self) -> $type {
            match self {
                Self::Td1(d) => &d.$name,
                Self::Td2(d) => &d.$name,
                Self::Td3(d) => &d.$name,
                Self::MrvA(d) => &d.$name,
                Self::MrvB(d) => &d.$name,
            }
        }
    };
    ($name:ident, $type:ty, copy) => {
        pub fn $name(&self) -> $type {
            match self {
                Self::Td1(d) => d.$name,
                Self::Td2(d) => d.$name,
                Self::Td3(d) => d.$name,
                Self::MrvA(d) => d.$name,
                Self::MrvB(d) => d.$name,
            }
        }
    };
    ($name:ident, $type:ty, td1) => {
        pub fn $name(&self) -> Option<$type> {
            match self {
                Self::Td1(d) => Some(&d.$name),
                _ => None,
            }
        }
    };
    ($name:ident, $type:ty, td3) => {
        pub fn $name(&self) -> Option<$type> {
            match self {
                Self::Td3(d) => Some(d.$name),
                _ => None,
            }
        }
    };
    ($name:ident, $type:ty, documents) => {
        pub fn $name(&self) -> Option<$type> {
            match self {
                Self::Td1(d) => Some(d.$name),
                Self::Td2(d) => Some(d.$name),
                Self::Td3(d) => Some(d.$name),
                Self::MrvA(_)|Self::MrvB(_) => None,
            }
        }
    };
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MrzData {
    Td1(Td1Data),
    Td2(Td2Data),
    Td3(Td3Data),
    MrvA(MrvData),
    MrvB(MrvData),
}
impl MrzData {
    mrz_field!(document_type, &str);
    mrz_field!(issuer, &str);
    mrz_field!(document_number, &str);
    mrz_field!(document_number_check, char, copy);
    mrz_field!(optional_data_1, &str);
    mrz_field!(date_of_birth, &str);
    mrz_field!(date_of_birth_check, char, copy);
    mrz_field!(sex, Sex, copy);
    mrz_field!(date_of_expiry, &str);
    mrz_field!(date_of_expiry_check, char, copy);
    mrz_field!(nationality, &str);
    mrz_field!(name, &str);
    mrz_field!(optional_data_2, &str, td1);
    mrz_field!(optional_data_1_check, char, td3);
    mrz_field!(composite_check, char, documents);

    pub fn variant(&self) -> Variant {
        match self {
            Self::Td1(_) => Variant::Td1,
            Self::Td2(_) => Variant::Td2,
            Self::Td3(_) => Variant::Td3,
            Self::MrvA(_) => Variant::MrvA,
            Self::MrvB(_) => Variant::MrvB,
        }
    }

    /// Parses a machine-readable zone and verifies its check digits.
    ///
    /// The lines may be separated by line breaks or simply concatenated.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let data = Self::parse_unchecked(text)?;
        data.validate()?;
        Ok(data)
    }

    /// Parses a machine-readable zone without verifying check digits.
    pub fn parse_unchecked(text: &str) -> Result<Self, ParseError> {
        let lines = split_lines(text)?;
        match lines.as_slice() {
            [l1, l2, l3] if l1.len() == TD1_WIDTH && l2.len() == TD1_WIDTH && l3.len() == TD1_WIDTH => {
                Ok(Self::Td1(Td1Data {
                    document_type: field(l1, 0..2),
                    issuer: field(l1, 2..5),
                    document_number: field(l1, 5..14),
                    document_number_check: char_at(l1, 14),
                    optional_data_1: field(l1, 15..30),
                    date_of_birth: field(l2, 0..6),
                    date_of_birth_check: char_at(l2, 6),
                    sex: Sex::from_char(char_at(l2, 7))?,
                    date_of_expiry: field(l2, 8..14),
                    date_of_expiry_check: char_at(l2, 14),
                    nationality: field(l2, 15..18),
                    optional_data_2: field(l2, 18..29),
                    composite_check: char_at(l2, 29),
                    name: field(l3, 0..30),
                }))
            },
            [l1, l2] if l1.len() == TD2_WIDTH && l2.len() == TD2_WIDTH => {
                if l1.starts_with('V') {
                    Ok(Self::MrvB(parse_mrv(l1, l2)?))
                } else {
                    Ok(Self::Td2(Td2Data {
                        document_type: field(l1, 0..2),
                        issuer: field(l1, 2..5),
                        name: field(l1, 5..36),
                        document_number: field(l2, 0..9),
                        document_number_check: char_at(l2, 9),
                        nationality: field(l2, 10..13),
                        date_of_birth: field(l2, 13..19),
                        date_of_birth_check: char_at(l2, 19),
                        sex: Sex::from_char(char_at(l2, 20))?,
                        date_of_expiry: field(l2, 21..27),
                        date_of_expiry_check: char_at(l2, 27),
                        optional_data_1: field(l2, 28..35),
                        composite_check: char_at(l2, 35),
                    }))
                }
            },
            [l1, l2] if l1.len() == TD3_WIDTH && l2.len() == TD3_WIDTH => {
                if l1.starts_with('V') {
                    Ok(Self::MrvA(parse_mrv(l1, l2)?))
                } else {
                    Ok(Self::Td3(Td3Data {
                        document_type: field(l1, 0..2),
                        issuer: field(l1, 2..5),
                        name: field(l1, 5..44),
                        document_number: field(l2, 0..9),
                        document_number_check: char_at(l2, 9),
                        nationality: field(l2, 10..13),
                        date_of_birth: field(l2, 13..19),
                        date_of_birth_check: char_at(l2, 19),
                        sex: Sex::from_char(char_at(l2, 20))?,
                        date_of_expiry: field(l2, 21..27),
                        date_of_expiry_check: char_at(l2, 27),
                        optional_data_1: field(l2, 28..42),
                        optional_data_1_check: char_at(l2, 42),
                        composite_check: char_at(l2, 43),
                    }))
                }
            },
            other => Err(ParseError::InvalidLayout {
                lines: other.len(),
                length: other.first().map(|l| l.len()).unwrap_or(0),
            }),
        }
    }

    /// Encodes the data back into the lines of a machine-readable zone.
    pub fn to_lines(&self) -> Vec<String> {
        match self {
            Self::Td1(d) => {
                let mut l1 = String::with_capacity(TD1_WIDTH);
                l1.push_str(&d.document_type);
                l1.push_str(&d.issuer);
                l1.push_str(&d.document_number);
                l1.push(d.document_number_check);
                l1.push_str(&d.optional_data_1);

                let mut l2 = String::with_capacity(TD1_WIDTH);
                l2.push_str(&d.date_of_birth);
                l2.push(d.date_of_birth_check);
                l2.push(d.sex.as_char());
                l2.push_str(&d.date_of_expiry);
                l2.push(d.date_of_expiry_check);
                l2.push_str(&d.nationality);
                l2.push_str(&d.optional_data_2);
                l2.push(d.composite_check);

                vec![l1, l2, d.name.to_string()]
            },
            Self::Td2(d) => {
                let mut l1 = String::with_capacity(TD2_WIDTH);
                l1.push_str(&d.document_type);
                l1.push_str(&d.issuer);
                l1.push_str(&d.name);

                let mut l2 = common_second_line(
                    &d.document_number, d.document_number_check, &d.nationality, &d.date_of_birth,
                    d.date_of_birth_check, d.sex, &d.date_of_expiry, d.date_of_expiry_check,
                );
                l2.push_str(&d.optional_data_1);
                l2.push(d.composite_check);
                vec![l1, l2]
            },
            Self::Td3(d) => {
                let mut l1 = String::with_capacity(TD3_WIDTH);
                l1.push_str(&d.document_type);
                l1.push_str(&d.issuer);
                l1.push_str(&d.name);

                let mut l2 = common_second_line(
                    &d.document_number, d.document_number_check, &d.nationality, &d.date_of_birth,
                    d.date_of_birth_check, d.sex, &d.date_of_expiry, d.date_of_expiry_check,
                );
                l2.push_str(&d.optional_data_1);
                l2.push(d.optional_data_1_check);
                l2.push(d.composite_check);
                vec![l1, l2]
            },
            Self::MrvA(d)|Self::MrvB(d) => {
                let mut l1 = String::new();
                l1.push_str(&d.document_type);
                l1.push_str(&d.issuer);
                l1.push_str(&d.name);

                let mut l2 = common_second_line(
                    &d.document_number, d.document_number_check, &d.nationality, &d.date_of_birth,
                    d.date_of_birth_check, d.sex, &d.date_of_expiry, d.date_of_expiry_check,
                );
                l2.push_str(&d.optional_data_1);
                vec![l1, l2]
            },
        }
    }

    /// Encodes the data into a machine-readable zone with lines separated by `\n`.
    pub fn encode(&self) -> String {
        self.to_lines().join("\n")
    }

    /// The complete document number without filler characters.
    ///
    /// For TD1 documents whose number does not fit the nine-character field, the remainder is
    /// taken from the start of optional data 1.
    pub fn full_document_number(&self) -> String {
        match self.document_number_extension() {
            Some((extension, _check)) => format!("{}{}", self.document_number(), extension),
            None => trim_filler(self.document_number()).to_owned(),
        }
    }

    /// Overflow characters of a long TD1 document number and the check digit of the whole number.
    fn document_number_extension(&self) -> Option<(&str, char)> {
        let Self::Td1(d) = self else { return None };
        if d.document_number_check != '<' {
            return None;
        }
        let optional = d.optional_data_1.as_str();
        let end = optional.find('<').unwrap_or(optional.len());
        if end == 0 {
            return None;
        }
        Some((&optional[..end-1], char_at(optional, end-1)))
    }

    pub fn is_document_number_valid(&self) -> bool {
        self.check_document_number().is_ok()
    }

    pub fn is_date_of_birth_valid(&self) -> bool {
        verify_check_digit("date of birth", self.date_of_birth(), self.date_of_birth_check()).is_ok()
    }

    pub fn is_date_of_expiry_valid(&self) -> bool {
        verify_check_digit("date of expiry", self.date_of_expiry(), self.date_of_expiry_check()).is_ok()
    }

    fn check_document_number(&self) -> Result<(), ParseError> {
        if self.document_number_check() == '<' {
            if let Some((extension, check)) = self.document_number_extension() {
                let mut whole = self.document_number().to_owned();
                whole.push_str(extension);
                return verify_check_digit("document number", &whole, check);
            }
        }
        verify_check_digit("document number", self.document_number(), self.document_number_check())
    }

    /// Verifies every check digit the layout carries.
    pub fn validate(&self) -> Result<(), ParseError> {
        self.check_document_number()?;
        verify_check_digit("date of birth", self.date_of_birth(), self.date_of_birth_check())?;
        verify_check_digit("date of expiry", self.date_of_expiry(), self.date_of_expiry_check())?;

        if let Self::Td3(d) = self {
            let empty = d.optional_data_1.chars().all(|c| c == '<');
            if !(empty && d.optional_data_1_check == '<') {
                verify_check_digit("optional data", &d.optional_data_1, d.optional_data_1_check)?;
            }
        }

        let lines = self.to_lines();
        let (composite_data, composite_check) = match self {
            Self::Td1(d) => {
                let (l1, l2) = (&lines[0], &lines[1]);
                (format!("{}{}{}{}", &l1[5..30], &l2[0..7], &l2[8..15], &l2[18..29]), d.composite_check)
            },
            Self::Td2(d) => {
                let l2 = &lines[1];
                (format!("{}{}{}", &l2[0..10], &l2[13..20], &l2[21..35]), d.composite_check)
            },
            Self::Td3(d) => {
                let l2 = &lines[1];
                (format!("{}{}{}", &l2[0..10], &l2[13..20], &l2[21..43]), d.composite_check)
            },
            Self::MrvA(_)|Self::MrvB(_) => return Ok(()),
        };
        verify_check_digit("composite", &composite_data, composite_check)
    }
}
impl fmt::Display for MrzData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
impl FromStr for MrzData {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}


#[allow(clippy::too_many_arguments)]
fn common_second_line(
    document_number: &str, document_number_check: char, nationality: &str, date_of_birth: &str,
    date_of_birth_check: char, sex: Sex, date_of_expiry: &str, date_of_expiry_check: char,
) -> String {
    let mut ret = String::with_capacity(TD3_WIDTH);
    ret.push_str(document_number);
    ret.push(document_number_check);
    ret.push_str(nationality);
    ret.push_str(date_of_birth);
    ret.push(date_of_birth_check);
    ret.push(sex.as_char());
    ret.push_str(date_of_expiry);
    ret.push(date_of_expiry_check);
    ret
}

fn parse_mrv(l1: &str, l2: &str) -> Result<MrvData, ParseError> {
    Ok(MrvData {
        document_type: field(l1, 0..2),
        issuer: field(l1, 2..5),
        name: field(l1, 5..l1.len()),
        document_number: field(l2, 0..9),
        document_number_check: char_at(l2, 9),
        nationality: field(l2, 10..13),
        date_of_birth: field(l2, 13..19),
        date_of_birth_check: char_at(l2, 19),
        sex: Sex::from_char(char_at(l2, 20))?,
        date_of_expiry: field(l2, 21..27),
        date_of_expiry_check: char_at(l2, 27),
        optional_data_1: field(l2, 28..l2.len()),
    })
}

/// Splits MRZ text into lines, accepting both line breaks and concatenated lines.
///
/// Every character must be an uppercase letter, a digit or `<`, which makes byte-based slicing of
/// the lines safe afterwards.
fn split_lines(text: &str) -> Result<Vec<&str>, ParseError> {
    let lines: Vec<&str> = text.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();

    let mut position = 0;
    for line in &lines {
        for character in line.chars() {
            if !is_mrz_character(character) {
                return Err(ParseError::InvalidCharacter { character, position });
            }
            position += 1;
        }
    }

    if let [line] = lines.as_slice() {
        let width = match line.len() {
            90 => TD1_WIDTH,
            72 => TD2_WIDTH,
            88 => TD3_WIDTH,
            other => return Err(ParseError::InvalidLayout { lines: 1, length: other }),
        };
        let ret: Vec<&str> = (0..line.len() / width)
            .map(|i| &line[i*width..(i+1)*width])
            .collect();
        return Ok(ret);
    }
    Ok(lines)
}

fn is_mrz_character(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '<'
}

fn field<T: for<'a> From<&'a str>>(line: &str, range: Range<usize>) -> T {
    T::from(&line[range])
}

fn char_at(line: &str, index: usize) -> char {
    char::from(line.as_bytes()[index])
}

fn verify_check_digit(field: &'static str, data: &str, expected: char) -> Result<(), ParseError> {
    let computed = check_digit(data);
    if expected.to_digit(10) == Some(u32::from(computed)) {
        Ok(())
    } else {
        Err(ParseError::CheckDigit { field, expected, computed })
    }
}


/// Removes the `<` filler characters at the end of a field.
pub fn trim_filler(field: &str) -> &str {
    field.trim_end_matches('<')
}


/// Calculates the check digit of an MRZ field.
///
/// Digits count as their value, letters `A` to `Z` as 10 to 35, and `<` (as well as anything else)
/// as zero; the values are weighted 7, 3, 1 repeating and summed modulo 10.
pub fn check_digit(data: &str) -> u8 {
    const WEIGHTS: [u32; 3] = [7, 3, 1];

    let sum: u32 = data.chars()
        .zip(WEIGHTS.iter().cycle())
        .map(|(c, weight)| {
            let value = match c {
                '0'..='9' => u32::from(c) - u32::from('0'),
                'A'..='Z' => u32::from(c) - u32::from('A') + 10,
                _ => 0,
            };
            value * weight
        })
        .sum();
    (sum % 10) as u8
}


/// The MRZ fields needed to derive Basic Access Control keys.
///
/// Check digits are not stored; they are calculated whenever the MRZ information is assembled.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MrzInfo {
    document_number: SmallString<[u8; 22]>,
    date_of_birth: SmallString<[u8; 6]>,
    date_of_expiry: SmallString<[u8; 6]>,
}
impl MrzInfo {
    /// Creates the MRZ information from raw fields.
    ///
    /// The document number is uppercased, spaces become `<`, and it is padded to nine characters.
    /// Dates may be given as `YYMMDD`, `YYYYMMDD` or `YYYY-MM-DD`.
    pub fn new(document_number: &str, date_of_birth: &str, date_of_expiry: &str) -> Result<Self, ParseError> {
        let mut number: SmallString<[u8; 22]> = document_number.trim()
            .chars()
            .map(|c| if c == ' ' { '<' } else { c.to_ascii_uppercase() })
            .collect();
        if trim_filler(&number).is_empty() {
            return Err(ParseError::EmptyDocumentNumber);
        }
        if let Some((position, character)) = number.chars().enumerate().find(|(_, c)| !is_mrz_character(*c)) {
            return Err(ParseError::InvalidCharacter { character, position });
        }
        let length = number.chars().count();
        if length > DOCUMENT_NUMBER_LENGTH {
            return Err(ParseError::DocumentNumberTooLong { length });
        }
        while number.len() < DOCUMENT_NUMBER_LENGTH {
            number.push('<');
        }

        Ok(Self {
            document_number: number,
            date_of_birth: normalize_date(date_of_birth)?,
            date_of_expiry: normalize_date(date_of_expiry)?,
        })
    }

    /// Takes the MRZ information from a parsed machine-readable zone.
    pub fn from_mrz(mrz: &MrzData) -> Self {
        let mut number: SmallString<[u8; 22]> = SmallString::from(mrz.full_document_number().as_str());
        while number.len() < DOCUMENT_NUMBER_LENGTH {
            number.push('<');
        }
        Self {
            document_number: number,
            date_of_birth: SmallString::from(mrz.date_of_birth()),
            date_of_expiry: SmallString::from(mrz.date_of_expiry()),
        }
    }

    pub fn document_number(&self) -> &str { &self.document_number }
    pub fn date_of_birth(&self) -> &str { &self.date_of_birth }
    pub fn date_of_expiry(&self) -> &str { &self.date_of_expiry }

    /// Assembles document number, date of birth and date of expiry, each followed by its check
    /// digit.
    pub fn mrz_information(&self) -> String {
        let mut ret = String::with_capacity(22 + 1 + 6 + 1 + 6 + 1);
        for value in [self.document_number.as_str(), self.date_of_birth.as_str(), self.date_of_expiry.as_str()] {
            ret.push_str(value);
            ret.push(char::from(b'0' + check_digit(value)));
        }
        ret
    }
}
impl FromStr for MrzInfo {
    type Err = ParseError;

    /// Parses a complete machine-readable zone and extracts the MRZ information.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mrz = MrzData::parse(s)?;
        Ok(Self::from_mrz(&mrz))
    }
}


fn normalize_date(value: &str) -> Result<SmallString<[u8; 6]>, ParseError> {
    let invalid = || ParseError::InvalidDate { value: value.to_owned() };

    let digits: String = value.trim().chars().filter(|c| *c != '-').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let yymmdd = match digits.len() {
        6 => &digits[..],
        8 => &digits[2..],
        _ => return Err(invalid()),
    };

    let month: u8 = yymmdd[2..4].parse().map_err(|_| invalid())?;
    let day: u8 = yymmdd[4..6].parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(invalid());
    }
    Ok(SmallString::from(yymmdd))
}
