use anyhow::Result;
use std::io::Write;

use crate::lookup::geo::GeoRecord;
use crate::state::BorderRecord;

const HEADER: [&str; 25] = [
    "path_key",
    "direction",
    "inner_ip",
    "inner_asn",
    "inner_ttl",
    "inner_rtts",
    "outer_ip",
    "outer_asn",
    "outer_ttl",
    "outer_rtts",
    "is_ixp_pop",
    "is_known_pop",
    "separation_distance_km",
    "separated",
    "colocated",
    "inner_place",
    "inner_country",
    "inner_lat",
    "inner_lng",
    "inner_method",
    "outer_place",
    "outer_country",
    "outer_lat",
    "outer_lng",
    "outer_method",
];

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// RTT samples as `a;b;c`
fn join_rtts(rtts: &[f64]) -> String {
    rtts.iter().map(|r| format!("{:.3}", r)).collect::<Vec<_>>().join(";")
}

fn location_fields(loc: Option<&GeoRecord>) -> [String; 5] {
    match loc {
        Some(loc) => [
            loc.place.clone(),
            loc.country.clone(),
            format!("{:.5}", loc.latitude),
            format!("{:.5}", loc.longitude),
            loc.method.to_string(),
        ],
        None => Default::default(),
    }
}

/// Export border records to CSV, one row per path
pub fn export_csv<W: Write>(records: &[BorderRecord], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(HEADER)?;

    for r in records {
        let mut row = vec![
            r.path_key.clone(),
            r.direction.to_string(),
            opt(r.inner_ip),
            opt(r.inner_asn),
            opt(r.inner_ttl),
            r.inner_rtts.as_deref().map(join_rtts).unwrap_or_default(),
            r.outer_ip.to_string(),
            opt(r.outer_asn),
            r.outer_ttl.to_string(),
            join_rtts(&r.outer_rtts),
            r.is_ixp_pop.to_string(),
            opt(r.is_known_pop),
            opt(r.separation_distance_km.map(|d| format!("{:.3}", d))),
            r.separated.to_string(),
            r.colocated.to_string(),
        ];
        row.extend(location_fields(r.inner_location.as_ref()));
        row.extend(location_fields(r.outer_location.as_ref()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}
