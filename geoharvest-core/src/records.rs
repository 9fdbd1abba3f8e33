use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub fn skip_comment_lines(content: &str) -> String {
    content.lines().filter(|l| !l.starts_with('#')).join("\n")
}

// CountryInfo
// http://download.geonames.org/export/dump/countryInfo.txt
// ISO	ISO3	ISO-Numeric	fips	Country	Capital	Area(in sq km)	Population	Continent	tld	CurrencyCode	CurrencyName	Phone	Postal Code Format	Postal Code Regex	Languages	geonameid	neighbours	EquivalentFipsCode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryInfo {
    /// ISO-3166 2-letter country code
    pub code: String,
    pub name: String,
    /// 2-letter continent code
    pub continent: String,
}

/// Parse the master country index. Comment lines (first byte `#`) are
/// skipped; rows missing any of the three retained columns are dropped.
pub fn parse_country_index(content: &str) -> Vec<CountryInfo> {
    let content = skip_comment_lines(content);

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(content.as_bytes());

    rdr.byte_records()
        .filter_map(|row| {
            let row = row.ok()?;
            Some(CountryInfo {
                code: non_empty(&row, 0)?.to_owned(),
                name: non_empty(&row, 4)?.to_owned(),
                continent: non_empty(&row, 8)?.to_owned(),
            })
        })
        .collect()
}

/// Decode one column, mapping a missing or empty field to *absent*.
pub(crate) fn non_empty(row: &csv::ByteRecord, index: usize) -> Option<&str> {
    match row.get(index) {
        Some(field) if !field.is_empty() => std::str::from_utf8(field).ok(),
        _ => None,
    }
}

/// Feature classes that survive the curation filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureClass {
    /// Class `A`: administrative entity (country, state, county, ...)
    Admin,
    /// Class `P`: populated place (city, town, village, ...)
    Populated,
}

// Curated subset of the main 'geoname' table columns:
// ---------------------------------------------------
// geonameid         : integer id of record in geonames database
// name              : name of geographical point (utf8) varchar(200)
// latitude          : latitude in decimal degrees (wgs84)
// longitude         : longitude in decimal degrees (wgs84)
// feature class     : see http://www.geonames.org/export/codes.html, char(1)
// feature code      : see http://www.geonames.org/export/codes.html, varchar(10)
// country code      : ISO-3166 2-letter country code, 2 characters
// admin1..admin4    : administrative subdivision codes, varchar(20)
// population        : bigint (8 byte int)
// timezone          : the iana timezone id (see file timeZone.txt) varchar(40)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeonameRecord {
    pub id: u32,
    pub name: String,
    pub latitude: f32,
    pub longitude: f32,
    pub feature_class: FeatureClass,
    pub feature_code: String,
    pub country_code: String,
    pub admin1: Option<String>,
    pub admin2: Option<String>,
    pub admin3: Option<String>,
    pub admin4: Option<String>,
    pub population: u64,
    pub timezone: String,
    /// Human-readable admin area names, filled in for populated places
    /// during enrichment and always absent on admin records.
    pub admin1_txt: Option<String>,
    pub admin2_txt: Option<String>,
    pub admin3_txt: Option<String>,
    pub admin4_txt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_INDEX: &str = "\
# GeoNames country info
# ISO\tISO3\tISO-Numeric\tfips\tCountry\tCapital\tArea\tPopulation\tContinent
LI\tLIE\t438\tLS\tLiechtenstein\tVaduz\t160\t39137\tEU\t.li\tCHF\tFranc\t423\t9490\t9490\tde-LI,gsw,wae\t3042058\tCH,AT\t
GB\tGBR\t826\tUK\tUnited Kingdom\tLondon\t244820\t66488991\tEU\t.uk\tGBP\tPound\t44\t\t\ten-GB,cy-GB,gd\t2635167\tIE\t";

    #[test]
    fn comment_lines_produce_no_entries() {
        let countries = parse_country_index("# only\n#comments\n");
        assert!(countries.is_empty());
    }

    #[test]
    fn master_index_rows() {
        let countries = parse_country_index(MASTER_INDEX);
        assert_eq!(countries.len(), 2);
        assert_eq!(
            countries[0],
            CountryInfo {
                code: "LI".into(),
                name: "Liechtenstein".into(),
                continent: "EU".into(),
            }
        );
        assert_eq!(countries[1].code, "GB");
        assert_eq!(countries[1].continent, "EU");
    }

    #[test]
    fn short_master_rows_are_dropped() {
        let countries = parse_country_index("XX\tXXX\t0\tXX\tNowhere\n");
        assert!(countries.is_empty());
    }
}
