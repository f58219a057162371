//! Download command implementation.

use super::CommandResult;
use osmsync_protocol::{Bounds, OsmDocumentWriter, OsmRecord, PrimitiveType};
use osmsync_transfer::{TransferResult, TransferSession};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// What to download.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadSource {
    /// Everything inside a bounding box.
    Map(Bounds),
    /// Primitives of one kind by id.
    Objects(PrimitiveType, Vec<i64>),
}

impl DownloadSource {
    /// Parses a `min_lon,min_lat,max_lon,max_lat` box.
    pub fn bbox(raw: &str) -> CommandResult<Self> {
        Bounds::from_bbox_param(raw)
            .map(DownloadSource::Map)
            .ok_or_else(|| format!("invalid bbox '{}'", raw).into())
    }

    /// Parses a kind name and a comma separated id list.
    pub fn objects(kind: &str, ids: &str) -> CommandResult<Self> {
        let kind = PrimitiveType::from_api_name(kind)
            .ok_or_else(|| format!("unknown element type '{}'", kind))?;
        let ids = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<i64>().map_err(|_| format!("invalid id '{}'", s)))
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Err("no ids given".into());
        }
        Ok(DownloadSource::Objects(kind, ids))
    }
}

/// Downloads into an `<osm>` document at `output`. Returns the record count.
pub fn download(
    session: &TransferSession,
    source: &DownloadSource,
    output: &Path,
) -> CommandResult<usize> {
    let file = File::create(output)
        .map_err(|e| format!("cannot create {:?}: {}", output, e))?;
    let mut writer = OsmDocumentWriter::new(BufWriter::new(file))?;
    let mut sink = |record: OsmRecord| -> TransferResult<()> {
        match record {
            OsmRecord::Bounds(bounds) => writer.bounds(&bounds)?,
            OsmRecord::Primitive { primitive, .. } => writer.primitive(&primitive)?,
            OsmRecord::Changeset(changeset) => writer.changeset(&changeset)?,
        }
        Ok(())
    };
    let count = match source {
        DownloadSource::Map(bounds) => session.api().read_map(bounds, &mut sink)?,
        DownloadSource::Objects(kind, ids) => {
            session.api().fetch_primitives(*kind, ids, &mut sink)?
        }
    };
    writer.finish()?.flush()?;
    info!(records = count, output = %output.display(), "download finished");
    Ok(count)
}

/// Runs the download command.
pub fn run(session: &TransferSession, source: &DownloadSource, output: &Path) -> CommandResult<()> {
    let count = download(session, source, output)?;
    println!("✓ Wrote {} records to {}", count, output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;
    use osmsync_protocol::{OsmReader, Primitive};

    fn read_back(path: &Path) -> Vec<OsmRecord> {
        let file = File::open(path).unwrap();
        OsmReader::new(file).collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn map_download_writes_document() {
        let (server, session) = testing::session();
        let a = server.store().seed(Primitive::node(0, 48.0, 11.0).with_tag("amenity", "cafe"));
        let b = server.store().seed(Primitive::node(0, 48.1, 11.1));
        server.store().seed(Primitive::way(0, vec![a, b]));
        server.store().seed(Primitive::node(0, -30.0, 150.0));

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("map.osm");
        let source = DownloadSource::bbox("10.9,47.9,11.2,48.2").unwrap();
        let count = download(&session, &source, &output).unwrap();
        assert_eq!(count, 4);

        let records = read_back(&output);
        assert_eq!(records.len(), 4);
        match &records[0] {
            OsmRecord::Bounds(bounds) => assert_eq!(bounds.to_bbox_param(), "10.9,47.9,11.2,48.2"),
            other => panic!("unexpected record {:?}", other),
        }
        let cafe = records.iter().find_map(|r| match r {
            OsmRecord::Primitive { primitive, .. } if primitive.id == a => Some(primitive),
            _ => None,
        });
        assert_eq!(cafe.unwrap().tags["amenity"], "cafe");
    }

    #[test]
    fn object_download() {
        let (server, session) = testing::session();
        let a = server.store().seed(Primitive::node(0, 1.0, 1.0));
        let b = server.store().seed(Primitive::node(0, 2.0, 2.0));

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nodes.osm");
        let source = DownloadSource::objects("node", &format!("{}, {}", a, b)).unwrap();
        assert_eq!(download(&session, &source, &output).unwrap(), 2);
        assert_eq!(read_back(&output).len(), 2);
    }

    #[test]
    fn invalid_sources() {
        assert!(DownloadSource::bbox("1,2,3").is_err());
        assert!(DownloadSource::objects("area", "1").is_err());
        assert!(DownloadSource::objects("node", "x").is_err());
        assert!(DownloadSource::objects("node", "").is_err());
    }
}
