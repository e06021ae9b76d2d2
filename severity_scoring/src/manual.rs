/*!

This is the long-form manual for `severity_scoring` and `gapscore`.

## Input layout

`gapscore` reads a directory with one subdirectory per category. The names
are matched by prefix, ignoring case:

* `enrol*` enrolment records
* `demo*` demographic update records
* `bio*` biometric update records
* `camp*` service campaigns

Every `*.csv` file of a subdirectory is read. Files may be encoded in UTF-8 or
Latin-1, and may use `,`, `;`, tab or `|` as a delimiter.

### Demand files

Each row is one record. The following columns are used:

* the postal code column. It is found by looking at the values: the first
  column in which more than 10% of the values look like a 6-digit postal code
  is selected. `110001.0` is read as `110001`. Rows whose value does not clean
  up to exactly 6 digits are dropped.
* the month: either a `month` column (`December`, `dec`, `12`) or a column whose
  name contains `date`, read day first (`01-12-2025`). Rows with an unreadable
  month are dropped.
* the count columns: every column with an `age` token followed by a number,
  for instance `age_0_5`, `age_5_17`, `age_18_greater`, `bio_age_17_`. Values that
  cannot be read count as 0.

### Campaign files

Each row is one campaign, unless a column whose name ends in `count` is
present, in which case it holds the number of campaigns of the row.

## Scoring

For each postal code `p` and month `m`:

```text
raw_load(p, m) = sum_c  category_weight(c) * sum_b  bucket_weight(c, b) * count(b)
net_load(p, m) = raw_load(p, m) / denominator(p, m)
```

| category     | default weight | legacy weight |
|--------------|----------------|---------------|
| enrolment    | 1.0            | 1.0           |
| demographic  | 1.2            | 1.2           |
| biometric    | 2.5            | 1.5           |

| bracket | enrolment | demographic, biometric |
|---------|-----------|------------------------|
| 0-5     | 1.5       | 1.5                    |
| 5-17    | 1.2       | 1.5                    |
| 18+     | 1.0       | 1.2                    |

Denominators:

* `campaignCapacity` (default): `3.0 + 1.25 * campaigns(p)`
* `transactionVolume` (legacy): `3.0 + records(p, m) / 3.0`

The monthly series of each postal code is then collapsed into one score:

* `recursiveEma` (default): months in calendar order,
  `s = 0.4 * x + 0.6 * s`, starting from the first month.
* `calendarDecay` (legacy): `sum_m net_load(p, m) * w(m)` with `w(December) = 1.0`,
  `w(November) = 0.75`, ..., `w(January) = 0.04`.

Finally the scores are standardized against all the postal codes of the run
(population standard deviation) and classified:

| z-score | severity |
|---------|----------|
| >= 3    | Extreme  |
| >= 2    | Critical |
| >= 1    | High     |
| < 1     | Moderate |

Severity is relative to the run: the same postal code can change tier when
other postal codes are added to the input.

## Configuration file

```json
{
  "outputSettings": {
    "outputDirectory": "out",
    "topN": 200,
    "geoLookupPath": "pincode_master_clean.csv"
  },
  "sources": [
    { "category": "enrolment", "directory": "raw/Enrolment" },
    { "category": "campaign", "directory": "raw/Camps", "postalCodeColumn": "pin" }
  ],
  "rules": {
    "preset": "default",
    "categoryWeights": { "enrolment": 1.0, "demographic": 1.2, "biometric": 2.5 },
    "supplyDenominator": "campaignCapacity",
    "baselineCapacity": 3.0,
    "campaignCoefficient": 1.25,
    "aggregation": "recursiveEma",
    "smoothingFactor": 0.4,
    "positiveZOnly": false
  }
}
```

All the keys are optional. `preset` is `default` or `legacy`; the other rule
keys override the preset. The command line flags override the file.

## Outputs

* the ranked list, as a JSON array of `postal_code`, `aggregated_score`,
  `z_score`, `severity`, most severe first;
* the top-N critical extract (CSV) with a criticality index between 0 and 100;
* a summary (JSON) with the population statistics and the number of postal
  codes per tier. When a geographic lookup file is given, it also lists the
  states with the most Extreme and Critical postal codes and the districts with
  the largest cumulative score.

*/
