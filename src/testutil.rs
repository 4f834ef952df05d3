//! Fixtures shared by unit tests.

use bytes::Bytes;
use std::io::Write;

pub fn zip_archive(entries: &[(&str, &[u8])]) -> Bytes {
    let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        w.start_file(*name, opts).unwrap();
        w.write_all(data).unwrap();
    }
    Bytes::from(w.finish().unwrap().into_inner())
}

/// Three top-level items, the second a pure grouping node with two children.
pub fn grouped_manifest() -> &'static str {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest identifier="com.example.grouped" xmlns:adlcp="http://www.adlnet.org/xsd/adlcp_rootv1p2">
  <metadata><schemaversion>1.2</schemaversion></metadata>
  <organizations default="ORG">
    <organization identifier="ORG">
      <title>Grouped Course</title>
      <item identifier="I1" identifierref="R1"><title>Intro</title></item>
      <item identifier="G1">
        <title>Module</title>
        <item identifier="I2" identifierref="R2"><title>Part A</title></item>
        <item identifier="I3" identifierref="R3"><title>Part B</title></item>
      </item>
      <item identifier="I4" identifierref="R4">
        <title>Quiz</title>
        <adlcp:masteryscore>70</adlcp:masteryscore>
      </item>
    </organization>
  </organizations>
  <resources>
    <resource identifier="R1" type="webcontent" adlcp:scormtype="sco" href="intro.html"/>
    <resource identifier="R2" type="webcontent" adlcp:scormtype="sco" href="m2/a.html"/>
    <resource identifier="R3" type="webcontent" adlcp:scormtype="sco" href="m2/b.html"/>
    <resource identifier="R4" type="webcontent" adlcp:scormtype="sco" href="quiz.html"/>
  </resources>
</manifest>"#
}
