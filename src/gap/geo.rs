// Postal code to district, state and coordinates.

use std::collections::HashMap;
use std::path::Path;

use crate::gap::*;

#[derive(PartialEq, Debug, Clone)]
pub struct GeoRecord {
    pub postal_code: PostalCode,
    pub district: String,
    /// None when the source names no usable state.
    pub state: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

pub type GeoLookup = HashMap<PostalCode, GeoRecord>;

const STATE_FIXES: [(&str, Option<&str>); 10] = [
    ("100000", None),
    ("Select", None),
    ("Westbengal", Some("West Bengal")),
    ("West Bangal", Some("West Bengal")),
    ("Orissa", Some("Odisha")),
    ("Pondicherry", Some("Puducherry")),
    (
        "Dadra & Nagar Haveli",
        Some("Dadra and Nagar Haveli and Daman and Diu"),
    ),
    (
        "Daman & Diu",
        Some("Dadra and Nagar Haveli and Daman and Diu"),
    ),
    ("Jammu & Kashmir", Some("Jammu and Kashmir")),
    (
        "Andaman & Nicobar Islands",
        Some("Andaman and Nicobar Islands"),
    ),
];

const DISTRICT_FIXES: [(&str, &str); 6] = [
    ("Namakkal *", "Namakkal"),
    ("Tuticorin", "Thoothukkudi"),
    ("Kancheepuram", "Kanchipuram"),
    ("Viluppuram", "Villupuram"),
    ("Thiruvallur", "Tiruvallur"),
    ("The Nilgiris", "Nilgiris"),
];

/// Upper case after any non-letter, lower case elsewhere: `NEW DELHI` and
/// `new delhi` both become `New Delhi`.
pub fn title_case(s: &str) -> String {
    let mut res = String::with_capacity(s.len());
    let mut after_letter = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if after_letter {
                res.extend(c.to_lowercase());
            } else {
                res.extend(c.to_uppercase());
            }
            after_letter = true;
        } else {
            res.push(c);
            after_letter = false;
        }
    }
    res
}

pub fn normalize_state(raw: &str) -> Option<String> {
    let t = title_case(raw.trim());
    if t.is_empty() {
        return None;
    }
    match STATE_FIXES.iter().find(|(k, _)| *k == t) {
        Some((_, fix)) => fix.map(|s| s.to_string()),
        None => Some(t),
    }
}

pub fn normalize_district(raw: &str) -> String {
    let t = title_case(raw.trim());
    match DISTRICT_FIXES.iter().find(|(k, _)| *k == t) {
        Some((_, fix)) => fix.to_string(),
        None => t,
    }
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    let x: f64 = raw.trim().parse().ok()?;
    if x.is_finite() && x != 0.0 {
        Some(x)
    } else {
        None
    }
}

pub fn read_geo_lookup(path: &Path) -> GapResult<GeoLookup> {
    let table = io_csv::read_table(path)?;
    geo_lookup_from_table(&table, &path.display().to_string())
}

/// Builds the lookup from a table with the columns `pincode`, `district`,
/// `statename` (or `state`), `latitude` and `longitude`, in any case.
///
/// Rows with a missing or zero coordinate are dropped. When a postal code
/// appears several times, the first row wins.
pub fn geo_lookup_from_table(table: &RawTable, path: &str) -> GapResult<GeoLookup> {
    let col = |names: &[&str]| -> GapResult<usize> {
        names
            .iter()
            .find_map(|n| table.column_index(n))
            .context(MissingColumnSnafu {
                column: names[0],
                path,
            })
    };
    let pin_idx = col(&["pincode"])?;
    let district_idx = col(&["district"])?;
    let state_idx = col(&["statename", "state"])?;
    let lat_idx = col(&["latitude"])?;
    let lon_idx = col(&["longitude"])?;

    let mut res: GeoLookup = HashMap::new();
    let mut dropped = 0;
    for row in 0..table.num_rows() {
        let coords = (
            parse_coordinate(table.cell(row, lat_idx)),
            parse_coordinate(table.cell(row, lon_idx)),
        );
        let (latitude, longitude) = match coords {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                dropped += 1;
                continue;
            }
        };
        let postal_code = match PostalCode::parse(table.cell(row, pin_idx)) {
            Some(p) => p,
            None => {
                dropped += 1;
                continue;
            }
        };
        res.entry(postal_code.clone()).or_insert_with(|| GeoRecord {
            postal_code,
            district: normalize_district(table.cell(row, district_idx)),
            state: normalize_state(table.cell(row, state_idx)),
            latitude,
            longitude,
        });
    }
    info!(
        "geo lookup {}: {} rows, {} postal codes, {} rows dropped",
        path,
        table.num_rows(),
        res.len(),
        dropped
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> RawTable {
        let headers = ["PinCode", "District", "StateName", "Latitude", "Longitude"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = rows
            .iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect();
        RawTable::new(headers, rows)
    }

    #[test]
    fn title_case_like_place_names() {
        assert_eq!(title_case("NEW DELHI"), "New Delhi");
        assert_eq!(title_case("jammu & kashmir"), "Jammu & Kashmir");
        assert_eq!(title_case("namakkal *"), "Namakkal *");
        assert_eq!(title_case("100000"), "100000");
    }

    #[test]
    fn fixes_place_names() {
        assert_eq!(normalize_state("WESTBENGAL"), Some("West Bengal".to_string()));
        assert_eq!(normalize_state(" orissa "), Some("Odisha".to_string()));
        assert_eq!(normalize_state("Select"), None);
        assert_eq!(normalize_state("100000"), None);
        assert_eq!(normalize_state(""), None);
        assert_eq!(normalize_state("kerala"), Some("Kerala".to_string()));
        assert_eq!(normalize_district("THE NILGIRIS"), "Nilgiris");
        assert_eq!(normalize_district("Pune"), "Pune");
    }

    #[test]
    fn keeps_first_row_with_coordinates() {
        let t = table(&[
            &["110001", "new delhi", "DELHI", "0", "77.2"],
            &["110001", "Central Delhi", "Delhi", "28.63", "77.21"],
            &["110001", "Elsewhere", "Delhi", "1.0", "1.0"],
            &["560001", "Bangalore", "Karnataka", "", "77.59"],
            &["600001", "Chennai", "tamil nadu", "13.08", "80.27"],
        ]);
        let lookup = geo_lookup_from_table(&t, "test.csv").unwrap();
        assert_eq!(lookup.len(), 2);
        let r = &lookup[&PostalCode::parse("110001").unwrap()];
        assert_eq!(r.district, "Central Delhi");
        assert_eq!(r.latitude, 28.63);
        let r = &lookup[&PostalCode::parse("600001").unwrap()];
        assert_eq!(r.state, Some("Tamil Nadu".to_string()));
    }

    #[test]
    fn missing_column_is_an_error() {
        let t = RawTable::new(vec!["pincode".to_string()], vec![]);
        assert!(matches!(
            geo_lookup_from_table(&t, "test.csv"),
            Err(GapError::MissingColumn { .. })
        ));
    }
}
