///! Star name codec
///!
///! Procedural names such as "Tucanae Sector CQ-Y d79" pack into a sortable
///! 64-bit code. Everything else is a non-standard name, stored as a row in the
///! Names table and referenced by its id.
///!
///! ## Code layout (standard names, bit 44 set)
///! - L1 (5 bits) @ 38, L2 (5 bits) @ 33, L3 (5 bits) @ 28
///! - mass code (3 bits) @ 24
///! - N value (24 bits) @ 0, where N = N1 * 65536 + N2

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Sector name used for names with no procedural or survey prefix
pub const NON_STANDARD_SECTOR: &str = "NonStandard";

/// Catalogue prefixes that act as a sector for non-standard names
pub const SURVEY_PREFIXES: &[&str] = &[
    "HIP", "2MASS", "HD", "LTT", "TYC", "NGC", "HR", "LFT", "LHS", "LP", "Wolf",
];

const STANDARD_FLAG: u64 = 1 << 44;
const L1_SHIFT: u32 = 38;
const L2_SHIFT: u32 = 33;
const L3_SHIFT: u32 = 28;
const MASS_SHIFT: u32 = 24;
const LETTER_MASK: u64 = 0x1F;
const MASS_MASK: u64 = 0x7;
const N_MASK: u32 = 0xFF_FFFF;
const N2_MASK: u32 = 0xFFFF;

/// Largest Names row id a non-standard code can reference
pub const NAME_REF_MASK: u32 = 0xFF_FFFF;

static IDENTIFIER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{2}-[A-Za-z]$").expect("identifier pattern"));

static N_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)?(-(\d*))?$").expect("n value pattern"));

/// How much of a procedural name was supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    NonStandard,
    /// "<sector> AB-C"
    Identifier,
    /// "<sector> AB-C d"
    Masscode,
    /// "<sector> AB-C d12-"
    N1ValueOnly,
    /// "<sector> AB-C d79" or "<sector> AB-C d12-79"
    NValue,
}

/// Fields of a standard (procedural) name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StandardCode {
    /// Letters are 1-indexed, 'A' = 1
    pub l1: u8,
    pub l2: u8,
    pub l3: u8,
    /// 'a' = 0 .. 'h' = 7
    pub mass: u8,
    pub n: u32,
}

impl StandardCode {
    /// Build a code, rejecting fields that do not fit their bit widths
    pub fn new(l1: u8, l2: u8, l3: u8, mass: u8, n: u32) -> Option<Self> {
        let fits = (l1 as u64) <= LETTER_MASK
            && (l2 as u64) <= LETTER_MASK
            && (l3 as u64) <= LETTER_MASK
            && (mass as u64) <= MASS_MASK
            && n <= N_MASK;
        fits.then_some(Self { l1, l2, l3, mass, n })
    }

    pub fn n1(&self) -> u32 {
        self.n >> 16
    }

    pub fn n2(&self) -> u32 {
        self.n & N2_MASK
    }

    pub fn pack(&self) -> u64 {
        debug_assert!((self.l1 as u64) <= LETTER_MASK, "l1 out of range");
        debug_assert!((self.l2 as u64) <= LETTER_MASK, "l2 out of range");
        debug_assert!((self.l3 as u64) <= LETTER_MASK, "l3 out of range");
        debug_assert!((self.mass as u64) <= MASS_MASK, "mass code out of range");
        debug_assert!(self.n <= N_MASK, "n value out of range");

        STANDARD_FLAG
            | ((self.l1 as u64 & LETTER_MASK) << L1_SHIFT)
            | ((self.l2 as u64 & LETTER_MASK) << L2_SHIFT)
            | ((self.l3 as u64 & LETTER_MASK) << L3_SHIFT)
            | ((self.mass as u64 & MASS_MASK) << MASS_SHIFT)
            | (self.n & N_MASK) as u64
    }

    pub fn unpack(code: u64) -> Self {
        Self {
            l1: ((code >> L1_SHIFT) & LETTER_MASK) as u8,
            l2: ((code >> L2_SHIFT) & LETTER_MASK) as u8,
            l3: ((code >> L3_SHIFT) & LETTER_MASK) as u8,
            mass: ((code >> MASS_SHIFT) & MASS_MASK) as u8,
            n: (code as u32) & N_MASK,
        }
    }
}

/// The persisted name column: a packed procedural code or a Names row reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identifier {
    Standard(StandardCode),
    NonStandard { name_ref: u32 },
}

impl Identifier {
    pub fn pack(&self) -> u64 {
        match self {
            Identifier::Standard(code) => code.pack(),
            Identifier::NonStandard { name_ref } => (name_ref & NAME_REF_MASK) as u64,
        }
    }

    pub fn unpack(code: u64) -> Self {
        if code & STANDARD_FLAG != 0 {
            Identifier::Standard(StandardCode::unpack(code))
        } else {
            Identifier::NonStandard {
                name_ref: (code as u32) & NAME_REF_MASK,
            }
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, Identifier::Standard(_))
    }
}

/// A classified star name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub sector: String,
    pub entry_type: EntryType,
    pub identifier: Identifier,
    /// Name below the sector for non-standard names, empty otherwise
    pub star_name: String,
}

impl Classification {
    fn non_standard(sector: impl Into<String>, star_name: impl Into<String>) -> Self {
        Self {
            sector: sector.into(),
            entry_type: EntryType::NonStandard,
            identifier: Identifier::NonStandard { name_ref: 0 },
            star_name: star_name.into(),
        }
    }

    pub fn is_standard(&self) -> bool {
        self.identifier.is_standard()
    }

    /// Attach the sector name to a classification decoded from a bare code
    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = sector.into();
        self
    }

    /// Attach the Names row text to a decoded non-standard classification
    pub fn with_star_name(mut self, star_name: impl Into<String>) -> Self {
        self.star_name = star_name.into();
        self
    }

    /// Point a non-standard classification at its Names row
    pub fn set_name_ref(&mut self, name_ref: u32) {
        if let Identifier::NonStandard { name_ref: current } = &mut self.identifier {
            *current = name_ref & NAME_REF_MASK;
        }
    }

    /// The persisted code
    pub fn id(&self) -> u64 {
        self.identifier.pack()
    }

    /// Largest code that agrees with every field this entry actually fixed
    ///
    /// `id() ..= id_high()` is the range of all names sharing the supplied prefix.
    pub fn id_high(&self) -> u64 {
        let code = match self.identifier {
            Identifier::Standard(code) => code,
            Identifier::NonStandard { .. } => return self.id(),
        };

        let high = match self.entry_type {
            EntryType::Identifier => StandardCode {
                mass: MASS_MASK as u8,
                n: N_MASK,
                ..code
            },
            EntryType::Masscode => StandardCode { n: N_MASK, ..code },
            EntryType::N1ValueOnly => StandardCode {
                n: code.n | N2_MASK,
                ..code
            },
            EntryType::NValue | EntryType::NonStandard => code,
        };
        high.pack()
    }
}

fn letter_char(value: u8) -> char {
    if (1..=26).contains(&value) {
        (b'A' + value - 1) as char
    } else {
        '?'
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.identifier {
            Identifier::Standard(code) => code,
            Identifier::NonStandard { .. } => {
                return if self.sector.is_empty() || self.sector == NON_STANDARD_SECTOR {
                    write!(f, "{}", self.star_name)
                } else {
                    write!(f, "{} {}", self.sector, self.star_name)
                };
            }
        };

        if !self.sector.is_empty() {
            write!(f, "{} ", self.sector)?;
        }
        write!(
            f,
            "{}{}-{}",
            letter_char(code.l1),
            letter_char(code.l2),
            letter_char(code.l3)
        )?;

        if self.entry_type == EntryType::Identifier {
            return Ok(());
        }

        let mass = (b'a' + code.mass) as char;
        match self.entry_type {
            EntryType::Masscode => write!(f, " {}", mass),
            EntryType::N1ValueOnly => write!(f, " {}{}-", mass, code.n1()),
            _ if code.n <= N2_MASK => write!(f, " {}{}", mass, code.n),
            _ => write!(f, " {}{}-{}", mass, code.n1(), code.n2()),
        }
    }
}

/// Letters of an "AB-C" token, 1-indexed
fn parse_identifier_token(token: &str) -> Option<(u8, u8, u8)> {
    if !IDENTIFIER_TOKEN.is_match(token) {
        return None;
    }
    let bytes = token.as_bytes();
    let letter = |b: u8| b.to_ascii_uppercase() - b'A' + 1;
    Some((letter(bytes[0]), letter(bytes[1]), letter(bytes[3])))
}

/// Mass code and N value following an identifier token
///
/// `None` when the tokens cannot be represented by a standard code.
fn parse_suffix(rest: &[&str]) -> Option<(EntryType, u8, u32)> {
    let token = match rest {
        [] => return Some((EntryType::Identifier, 0, 0)),
        [token] => *token,
        _ => return None,
    };

    let mut chars = token.chars();
    let first = chars.next()?.to_ascii_lowercase();
    if !('a'..='h').contains(&first) {
        return None;
    }
    let mass = first as u8 - b'a';

    let caps = N_VALUE.captures(chars.as_str())?;
    let n1 = caps.get(1).map(|m| m.as_str().parse::<u32>()).transpose().ok()?;
    let dash = caps.get(2).is_some();
    let n2 = caps
        .get(3)
        .filter(|m| !m.as_str().is_empty())
        .map(|m| m.as_str().parse::<u32>())
        .transpose()
        .ok()?;

    match (n1, dash, n2) {
        (None, false, _) => Some((EntryType::Masscode, mass, 0)),
        (Some(n), false, _) if n <= N_MASK => Some((EntryType::NValue, mass, n)),
        (Some(n1), true, None) if n1 <= (N_MASK >> 16) => {
            Some((EntryType::N1ValueOnly, mass, n1 << 16))
        }
        (Some(n1), true, Some(n2)) if n1 <= (N_MASK >> 16) && n2 <= N2_MASK => {
            Some((EntryType::NValue, mass, (n1 << 16) | n2))
        }
        _ => None,
    }
}

fn classify_non_standard(name: &str, tokens: &[&str]) -> Classification {
    if tokens.len() > 1 && SURVEY_PREFIXES.iter().any(|p| p.eq_ignore_ascii_case(tokens[0])) {
        return Classification::non_standard(tokens[0], tokens[1..].join(" "));
    }
    Classification::non_standard(NON_STANDARD_SECTOR, name.trim())
}

/// Classify a star name
///
/// A name is standard when some token after the first has the shape "AB-C"
/// and everything after it fits the mass code / N value layout. Partial
/// names ("Tucanae Sector CQ-Y", "... CQ-Y d") classify as standard with a
/// narrower [`EntryType`] so they can drive range scans.
pub fn classify(name: &str) -> Classification {
    let tokens: Vec<&str> = name.split(' ').filter(|t| !t.is_empty()).collect();

    for (index, token) in tokens.iter().enumerate().skip(1) {
        let Some((l1, l2, l3)) = parse_identifier_token(token) else {
            continue;
        };

        let Some((entry_type, mass, n)) = parse_suffix(&tokens[index + 1..]) else {
            break;
        };

        let code = match StandardCode::new(l1, l2, l3, mass, n) {
            Some(code) => code,
            None => break,
        };

        return Classification {
            sector: tokens[..index].join(" "),
            entry_type,
            identifier: Identifier::Standard(code),
            star_name: String::new(),
        };
    }

    classify_non_standard(name, &tokens)
}

/// Classify a name for storage
///
/// Only complete procedural names whose canonical spelling reproduces the
/// input are stored as standard codes; anything else ("d079", partial names)
/// keeps its exact text in the Names table.
pub fn classify_canonical(name: &str) -> Classification {
    let classification = classify(name);
    if classification.is_standard()
        && (classification.entry_type != EntryType::NValue || classification.to_string() != name)
    {
        let tokens: Vec<&str> = name.split(' ').filter(|t| !t.is_empty()).collect();
        return classify_non_standard(name, &tokens);
    }
    classification
}

/// Classify a persisted code; the sector name is supplied by the caller
pub fn classify_id(code: u64) -> Classification {
    match Identifier::unpack(code) {
        identifier @ Identifier::Standard(_) => Classification {
            sector: String::new(),
            entry_type: EntryType::NValue,
            identifier,
            star_name: String::new(),
        },
        identifier @ Identifier::NonStandard { .. } => Classification {
            sector: String::new(),
            entry_type: EntryType::NonStandard,
            identifier,
            star_name: String::new(),
        },
    }
}

/// Full display name of a stored system
pub fn display_name(code: u64, sector: &str, names_text: Option<&str>) -> String {
    let classification = classify_id(code).with_sector(sector);
    match (&classification.identifier, names_text) {
        (Identifier::NonStandard { .. }, Some(text)) => {
            classification.with_star_name(text).to_string()
        }
        _ => classification.to_string(),
    }
}
